use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

/// Regular files of a `.tgz`, keyed by their path inside the archive.
pub fn archive_files(data: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut files = BTreeMap::new();
    for entry in archive.entries().expect("readable archive") {
        let mut entry = entry.expect("valid entry");
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        files.insert(name, contents);
    }
    files
}

/// Builds `<root>/data` holding `a.txt` = "x" and `sub/b.txt` = "y".
pub fn data_dir(root: &Path) -> std::path::PathBuf {
    let data = root.join("data");
    fs::create_dir_all(data.join("sub")).unwrap();
    fs::write(data.join("a.txt"), "x").unwrap();
    fs::write(data.join("sub/b.txt"), "y").unwrap();
    data
}
