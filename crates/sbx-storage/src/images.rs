use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use sbx_core::error::{already_exists, not_found};
use sbx_core::image::{ImageRelease, split_image_ref};
use sbx_core::time;

use crate::db::Database;

const IMAGE_COLUMNS: &str = "id, name, version, rootfs_path, kernel_image_path, \
     source_sandbox_id, virtual_size_bytes, allocated_size_bytes, created_at";

impl Database {
    /// Register a rootfs artifact in the catalog. `(name, version)` is
    /// unique; collisions surface as `AlreadyExists`.
    pub fn register_image(&self, image: &ImageRelease) -> Result<()> {
        let conn = self.lock_conn();
        let result = conn.execute(
            &format!(
                "INSERT INTO images ({IMAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                image.id,
                image.name,
                image.version,
                image.rootfs_path,
                image.kernel_image_path,
                image.source_sandbox_id,
                image.virtual_size_bytes,
                image.allocated_size_bytes,
                time::to_epoch(image.created_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(already_exists(format!(
                    "image {}:{} already exists",
                    image.name, image.version
                )))
            }
            Err(e) => Err(e).context("inserting image"),
        }
    }

    pub fn get_image(&self, id: &str) -> Result<ImageRelease> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1"),
                params![id],
                read_image_row,
            )
            .optional()?;
        row.ok_or_else(|| not_found(format!("image with id {:?} does not exist", id)))
    }

    /// Resolve an image reference: `name` or `name:version`. Unversioned
    /// references pick the newest release of that name.
    pub fn get_image_by_ref(&self, reference: &str) -> Result<ImageRelease> {
        let (name, version) = split_image_ref(reference);
        let conn = self.lock_conn();
        let row = match version {
            Some(version) => conn
                .query_row(
                    &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE name = ?1 AND version = ?2"),
                    params![name, version],
                    read_image_row,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!(
                        "SELECT {IMAGE_COLUMNS} FROM images WHERE name = ?1
                         ORDER BY created_at DESC, id DESC LIMIT 1"
                    ),
                    params![name],
                    read_image_row,
                )
                .optional()?,
        };
        row.ok_or_else(|| not_found(format!("image {:?} does not exist", reference)))
    }

    pub fn list_images(&self) -> Result<Vec<ImageRelease>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map([], read_image_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_image(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn();
        let deleted = conn.execute("DELETE FROM images WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(not_found(format!("image with id {:?} does not exist", id)));
        }
        Ok(())
    }
}

fn read_image_row(row: &Row<'_>) -> rusqlite::Result<ImageRelease> {
    let created_at: i64 = row.get(8)?;
    Ok(ImageRelease {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        rootfs_path: row.get(3)?,
        kernel_image_path: row.get(4)?,
        source_sandbox_id: row.get(5)?,
        virtual_size_bytes: row.get(6)?,
        allocated_size_bytes: row.get(7)?,
        created_at: time::from_epoch(created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::error::{is_already_exists, is_not_found};
    use sbx_core::id;

    fn image(name: &str, version: &str, created_at: i64) -> ImageRelease {
        ImageRelease {
            id: id::generate(),
            name: name.to_string(),
            version: version.to_string(),
            rootfs_path: format!("/var/lib/sbx/images/{name}/{version}/rootfs.ext4"),
            kernel_image_path: None,
            source_sandbox_id: None,
            virtual_size_bytes: Some(1 << 30),
            allocated_size_bytes: Some(64 << 20),
            created_at: time::from_epoch(created_at),
        }
    }

    #[test]
    fn test_register_and_get() {
        let db = Database::open_in_memory().unwrap();
        let img = image("alpine", "3.20", 1_700_000_000);
        db.register_image(&img).unwrap();

        let loaded = db.get_image(&img.id).unwrap();
        assert_eq!(loaded.name, "alpine");
        assert_eq!(loaded.virtual_size_bytes, Some(1 << 30));
    }

    #[test]
    fn test_duplicate_name_version_is_already_exists() {
        let db = Database::open_in_memory().unwrap();
        db.register_image(&image("alpine", "3.20", 1)).unwrap();
        let err = db.register_image(&image("alpine", "3.20", 2)).unwrap_err();
        assert!(is_already_exists(&err));
    }

    #[test]
    fn test_ref_resolution_versioned_and_latest() {
        let db = Database::open_in_memory().unwrap();
        db.register_image(&image("alpine", "3.19", 1_600_000_000)).unwrap();
        db.register_image(&image("alpine", "3.20", 1_700_000_000)).unwrap();

        assert_eq!(db.get_image_by_ref("alpine:3.19").unwrap().version, "3.19");
        assert_eq!(db.get_image_by_ref("alpine").unwrap().version, "3.20");
    }

    #[test]
    fn test_missing_image_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(is_not_found(&db.get_image_by_ref("ghost").unwrap_err()));
        assert!(is_not_found(&db.get_image("nope").unwrap_err()));
        assert!(is_not_found(&db.delete_image("nope").unwrap_err()));
    }

    #[test]
    fn test_list_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.register_image(&image("a", "1", 1_600_000_000)).unwrap();
        db.register_image(&image("b", "1", 1_700_000_000)).unwrap();
        let names: Vec<String> = db.list_images().unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
