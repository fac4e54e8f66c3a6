// sbx-cli: Thin command shell over the sbx client library.

mod commands;
pub mod display;
pub mod logging;
pub mod ui;

pub use commands::run;
pub use logging::LogFormat;
