//! Tarred BagIt bags.
//!
//! [`TarBagReader`] unpacks a tarred bag and builds the object graph;
//! [`pack_bag`] does the reverse for restores. Checks are limited to what
//! the pipelines depend on: a `bagit.txt`, at least one payload file, and
//! a `manifest-md5.txt` that agrees with the payload when present.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::domain::{GenericFile, IntellectualObject};
use crate::ports::{BagError, BagHeader, BagReader};

const MANIFEST_MD5: &str = "manifest-md5.txt";
const BAGIT_TXT: &str = "bagit.txt";
pub const TAG_MANIFEST_SHA256: &str = "tagmanifest-sha256.txt";

fn io_err(context: &str, err: impl std::fmt::Display) -> BagError {
    BagError::Io(format!("{context}: {err}"))
}

/// Path inside the bag with the top-level bag directory removed.
fn bag_relative(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest)
    }
}

fn is_safe(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

struct Entry {
    size: u64,
    md5: String,
    sha256: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TarBagReader;

impl TarBagReader {
    fn parse_manifest(text: &str, problems: &mut Vec<String>) -> BTreeMap<String, String> {
        let mut manifest = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(char::is_whitespace) {
                Some((digest, path)) => {
                    manifest.insert(path.trim().to_string(), digest.to_lowercase());
                }
                None => problems.push(format!("{MANIFEST_MD5} line {} is malformed", n + 1)),
            }
        }
        manifest
    }
}

impl BagReader for TarBagReader {
    fn read_bag(
        &self,
        tar_path: &Path,
        unpack_dir: &Path,
        header: &BagHeader,
    ) -> Result<IntellectualObject, BagError> {
        let file = File::open(tar_path).map_err(|e| io_err("open tar", e))?;
        let mut archive = tar::Archive::new(file);
        fs::create_dir_all(unpack_dir).map_err(|e| io_err("create unpack dir", e))?;

        let mut problems = Vec::new();
        let mut entries: BTreeMap<String, Entry> = BTreeMap::new();
        let mut manifest_text = None;
        let mut has_bagit = false;

        for entry in archive.entries().map_err(|e| io_err("read tar", e))? {
            let mut entry = entry.map_err(|e| io_err("read tar entry", e))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(|e| io_err("tar entry path", e))?.into_owned();
            let Some(relative) = bag_relative(&path) else {
                problems.push(format!("{} is outside the bag directory", path.display()));
                continue;
            };
            if !is_safe(&relative) {
                problems.push(format!("{} escapes the bag directory", path.display()));
                continue;
            }

            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| io_err("read tar entry", e))?;

            let target = unpack_dir.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err("create dir", e))?;
            }
            fs::write(&target, &data).map_err(|e| io_err("write file", e))?;

            let name = relative.to_string_lossy().replace('\\', "/");
            match name.as_str() {
                BAGIT_TXT => has_bagit = true,
                MANIFEST_MD5 => manifest_text = Some(String::from_utf8_lossy(&data).into_owned()),
                _ => {}
            }
            entries.insert(
                name,
                Entry {
                    size: data.len() as u64,
                    md5: format!("{:x}", md5::compute(&data)),
                    sha256: hex::encode(Sha256::digest(&data)),
                },
            );
        }

        if !has_bagit {
            problems.push(format!("bag is missing {BAGIT_TXT}"));
        }
        let payload: Vec<&String> = entries.keys().filter(|k| k.starts_with("data/")).collect();
        if payload.is_empty() {
            problems.push("bag has no payload files".to_string());
        }

        if let Some(text) = manifest_text {
            let manifest = Self::parse_manifest(&text, &mut problems);
            for (path, expected) in &manifest {
                match entries.get(path) {
                    None => problems.push(format!("{path} is in {MANIFEST_MD5} but not in the bag")),
                    Some(entry) if &entry.md5 != expected => problems.push(format!(
                        "{path}: md5 {} does not match manifest {expected}",
                        entry.md5
                    )),
                    Some(_) => {}
                }
            }
            for path in &payload {
                if !manifest.contains_key(path.as_str()) {
                    problems.push(format!("{path} is not listed in {MANIFEST_MD5}"));
                }
            }
        }

        if !problems.is_empty() {
            return Err(BagError::Invalid(problems));
        }

        let files = payload
            .into_iter()
            .filter_map(|path| entries.get(path).map(|e| (path, e)))
            .map(|(path, entry)| GenericFile {
                identifier: format!("{}/{}", header.object_identifier, path),
                object_identifier: header.object_identifier.clone(),
                path: path.clone(),
                size: entry.size,
                md5: Some(entry.md5.clone()),
                sha256: Some(entry.sha256.clone()),
                ..GenericFile::default()
            })
            .collect();

        Ok(IntellectualObject {
            identifier: header.object_identifier.clone(),
            institution: header.institution.clone(),
            bag_name: header.bag_name.clone(),
            etag: header.etag.clone(),
            files,
            ..IntellectualObject::default()
        })
    }
}

/// Builds a tarred bag named `bag_name` holding `files` (paths relative to
/// the bag root). Adds `bagit.txt` and `manifest-md5.txt` for payload files.
pub fn pack_bag(bag_name: &str, files: &[(String, Vec<u8>)]) -> Result<Vec<u8>, BagError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut append = |path: &str, data: &[u8]| -> Result<(), BagError> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{bag_name}/{path}"), data)
            .map_err(|e| io_err("append to tar", e))
    };

    append(BAGIT_TXT, b"BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n")?;
    let mut manifest = String::new();
    for (path, data) in files {
        append(path, data)?;
        if path.starts_with("data/") {
            manifest.push_str(&format!("{:x}  {path}\n", md5::compute(data)));
        }
    }
    append(MANIFEST_MD5, manifest.as_bytes())?;

    builder.into_inner().map_err(|e| io_err("finish tar", e))
}

/// SHA-256 of the bag's `tagmanifest-sha256.txt`, the value partner nodes
/// compare to confirm a replicated copy. `None` if the bag has no such file.
pub fn tag_manifest_digest(tar_path: &Path) -> Result<Option<String>, BagError> {
    let file = File::open(tar_path).map_err(|e| io_err("open tar", e))?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries().map_err(|e| io_err("read tar", e))? {
        let mut entry = entry.map_err(|e| io_err("read tar entry", e))?;
        let path = entry.path().map_err(|e| io_err("tar entry path", e))?.into_owned();
        if bag_relative(&path).is_some_and(|p| p == Path::new(TAG_MANIFEST_SHA256)) {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| io_err("read tar entry", e))?;
            return Ok(Some(hex::encode(Sha256::digest(&data))));
        }
    }
    Ok(None)
}
