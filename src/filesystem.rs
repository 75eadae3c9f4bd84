//! Working-directory helpers

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use anyhow::{Context, Result};
use zip::ZipArchive;

/// Is a file with exactly this name present in `dir`?
pub fn has_file(dir: &Path, name: &str) -> bool {
    dir.join(name).is_file()
}

/// Unpack a submission archive into the working directory
pub fn unpack_submission(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Could not open archive {:?}", archive_path))?;
    extract_zip(file, dest)
}

fn extract_zip<R: Read + Seek>(data: R, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(data)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        // ZIP Slip protection: only accept paths contained in dest
        let file_path = match file.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue,
        };

        let outpath = dest.join(&file_path);

        if file.name().ends_with('/') {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    #[test]
    fn has_file_only_matches_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.c"), "int main(){}").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();

        assert!(has_file(dir.path(), "main.c"));
        assert!(!has_file(dir.path(), "docs"));
        assert!(!has_file(dir.path(), "missing.c"));
    }

    #[test]
    fn unpacks_an_archive_into_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("submission.zip");

        let file = File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("main.c", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"int main(){return 0;}").unwrap();
        writer
            .start_file("src/util.c", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"// util").unwrap();
        writer.finish().unwrap();

        let work_dir = dir.path().join("job");
        std::fs::create_dir(&work_dir).unwrap();
        unpack_submission(&archive_path, &work_dir).unwrap();

        assert!(has_file(&work_dir, "main.c"));
        assert!(work_dir.join("src/util.c").is_file());
    }
}
