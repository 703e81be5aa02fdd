//! `kiln hash`: print dependency digests.

use std::path::PathBuf;

use kiln_cache::DependencyHasher;
use kiln_common::Digest;

use crate::{GlobalArgs, HashArgs};

/// Runs the `kiln hash` command.
///
/// Prints one `<digest>  <path>` line per file. Files that cannot be read are
/// reported on stderr and make the command exit with code 1.
pub fn run(args: &HashArgs, _global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let mut code = 0;
    for (path, digest) in digest_files(&args.files) {
        match digest {
            Some(digest) => println!("{digest}  {}", path.display()),
            None => {
                eprintln!("error: cannot read {}", path.display());
                code = 1;
            }
        }
    }
    Ok(code)
}

/// Hashes every file, yielding `None` for files that could not be read.
fn digest_files(files: &[PathBuf]) -> Vec<(&PathBuf, Option<Digest>)> {
    // The hasher reports any read failure as the all-zero digest.
    let digests = DependencyHasher::hash_files(files);
    files
        .iter()
        .zip(digests)
        .map(|(path, digest)| (path, (!digest.is_zero()).then_some(digest)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_files_are_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blur.bc");
        std::fs::write(&path, b"abc").unwrap();
        let files = vec![path];
        let result = digest_files(&files);
        assert_eq!(result[0].1, Some(DependencyHasher::hash(b"abc")));
    }

    #[test]
    fn unreadable_paths_have_no_digest() {
        let dir = tempfile::tempdir().unwrap();
        // Opening a directory succeeds but reading it fails.
        let files = vec![dir.path().to_path_buf(), dir.path().join("missing.bc")];
        let result = digest_files(&files);
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|(_, digest)| digest.is_none()));
    }
}
