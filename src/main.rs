use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    sbx_cli::run().await
}
