//! Standalone bundles: bytecode chunks and a trailing index appended to
//! the host executable, detected at startup by the magic in the file's
//! last eight bytes.
//!
//! Layout, back to front: `u32 LE index_size` and the 4-byte magic close
//! the file; the index sits just before them; the concatenated bytecode
//! blob sits before the index. Everything earlier is the untouched host
//! binary. Detection failure is silent, and a malformed index degrades to
//! "no bundle" so a damaged trailer never breaks normal startup.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 4] = b"LUSB";
pub const VERSION: u8 = 1;

/// Footer size: the u32 index length plus the magic.
const TRAILER: u64 = 8;

/// Sanity cap applied to the index's counts; a trailer claiming more is
/// treated as garbage.
const MAX_COUNT: u16 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bundle I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("bundle entry '{0}' does not fit the index format")]
    EntryTooLarge(String),

    #[error("bundle holds no file named '{0}'")]
    UnknownFile(String),
}

#[derive(Debug, Clone)]
struct FileEntry {
    name: String,
    offset: u32,
    size: u32,
}

/// A parsed bundle: the index contents plus enough geometry to read file
/// bodies out of the host binary on demand.
#[derive(Debug)]
pub struct Bundle {
    pub entrypoint: String,
    /// CLI arguments preserved at bundle time.
    pub args: Vec<String>,
    entries: Vec<FileEntry>,
    data_offset: u64,
    host_path: PathBuf,
}

/// Probe `path` (normally the running executable) for an appended bundle.
/// Absence and malformed trailers both return `None`.
pub fn detect(path: &Path) -> Result<Option<Bundle>, Error> {
    let mut file = File::open(path)?;
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < TRAILER {
        return Ok(None);
    }

    file.seek(SeekFrom::End(-(TRAILER as i64)))?;
    let mut trailer = [0u8; TRAILER as usize];
    file.read_exact(&mut trailer)?;
    if &trailer[4..] != MAGIC {
        return Ok(None);
    }
    let index_size = u32::from_le_bytes(trailer[..4].try_into().expect("4 bytes")) as u64;
    if index_size == 0 || index_size + TRAILER > file_size {
        tracing::debug!(index_size, "bundle trailer claims an impossible index");
        return Ok(None);
    }

    file.seek(SeekFrom::End(-((TRAILER + index_size) as i64)))?;
    let mut index = vec![0u8; index_size as usize];
    file.read_exact(&mut index)?;

    match parse_index(&index) {
        Some((entrypoint, args, entries)) => {
            let blob_size = entries
                .iter()
                .map(|e| e.offset as u64 + e.size as u64)
                .max()
                .unwrap_or(0);
            let Some(data_offset) = file_size
                .checked_sub(TRAILER + index_size)
                .and_then(|n| n.checked_sub(blob_size))
            else {
                tracing::debug!(blob_size, "bundle blob does not fit the host file");
                return Ok(None);
            };
            tracing::debug!(
                entrypoint = %entrypoint,
                files = entries.len(),
                data_offset,
                "bundle detected"
            );
            Ok(Some(Bundle {
                entrypoint,
                args,
                entries,
                data_offset,
                host_path: path.to_owned(),
            }))
        }
        None => {
            tracing::debug!("malformed bundle index ignored");
            Ok(None)
        }
    }
}

fn parse_index(index: &[u8]) -> Option<(String, Vec<String>, Vec<FileEntry>)> {
    let mut cur = std::io::Cursor::new(index);
    let version = cur.read_u8().ok()?;
    if version != VERSION {
        return None;
    }
    let num_args = cur.read_u16::<LittleEndian>().ok()?;
    let num_files = cur.read_u16::<LittleEndian>().ok()?;
    if num_args > MAX_COUNT || num_files > MAX_COUNT {
        return None;
    }
    let entrypoint = read_string(&mut cur)?;

    let mut args = Vec::with_capacity(num_args as usize);
    for _ in 0..num_args {
        args.push(read_string(&mut cur)?);
    }
    let mut entries = Vec::with_capacity(num_files as usize);
    for _ in 0..num_files {
        let name = read_string(&mut cur)?;
        let offset = cur.read_u32::<LittleEndian>().ok()?;
        let size = cur.read_u32::<LittleEndian>().ok()?;
        entries.push(FileEntry { name, offset, size });
    }
    Some((entrypoint, args, entries))
}

fn read_string(cur: &mut std::io::Cursor<&[u8]>) -> Option<String> {
    let len = cur.read_u16::<LittleEndian>().ok()? as usize;
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf).ok()?;
    String::from_utf8(buf).ok()
}

impl Bundle {
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Read one module's bytecode out of the blob.
    pub fn get_file(&self, name: &str) -> Result<Vec<u8>, Error> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::UnknownFile(name.to_owned()))?;
        let mut file = File::open(&self.host_path)?;
        file.seek(SeekFrom::Start(self.data_offset + entry.offset as u64))?;
        let mut buf = vec![0u8; entry.size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// The argv a bundled run synthesizes: the host's argv[0], the
    /// preserved bundle-time arguments, a `--` separator, the entrypoint
    /// name, then whatever the user passed at runtime.
    pub fn synthesized_args(&self, argv0: &str, user_args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() + user_args.len() + 3);
        out.push(argv0.to_owned());
        out.extend(self.args.iter().cloned());
        out.push("--".to_owned());
        out.push(self.entrypoint.clone());
        out.extend(user_args.iter().cloned());
        out
    }
}

/// Assembles a standalone executable: host binary, then the blob, index,
/// index size, and magic.
pub struct Writer {
    entrypoint: String,
    args: Vec<String>,
    files: Vec<(String, Vec<u8>)>,
}

impl Writer {
    pub fn new(entrypoint: &str) -> Self {
        Self {
            entrypoint: entrypoint.to_owned(),
            args: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Preserve a CLI argument to be replayed ahead of the entrypoint.
    pub fn preserve_arg(&mut self, arg: &str) -> &mut Self {
        self.args.push(arg.to_owned());
        self
    }

    pub fn add_file(&mut self, name: &str, bytecode: Vec<u8>) -> &mut Self {
        self.files.push((name.to_owned(), bytecode));
        self
    }

    /// Copy `host` to `out` and append the bundle. The output keeps the
    /// host's executable permissions.
    pub fn write(&self, host: &Path, out: &Path) -> Result<(), Error> {
        let index = self.encode_index()?;
        std::fs::copy(host, out)?;

        let mut file = std::fs::OpenOptions::new().append(true).open(out)?;
        for (_, bytecode) in &self.files {
            file.write_all(bytecode)?;
        }
        file.write_all(&index)?;
        file.write_u32::<LittleEndian>(index.len() as u32)?;
        file.write_all(MAGIC)?;
        file.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(out)?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            std::fs::set_permissions(out, perms)?;
        }
        tracing::debug!(
            out = %out.display(),
            files = self.files.len(),
            "standalone bundle written"
        );
        Ok(())
    }

    fn encode_index(&self) -> Result<Vec<u8>, Error> {
        let mut index = Vec::new();
        index.write_u8(VERSION).expect("vec write");
        index
            .write_u16::<LittleEndian>(self.count(self.args.len(), "args")?)
            .expect("vec write");
        index
            .write_u16::<LittleEndian>(self.count(self.files.len(), "files")?)
            .expect("vec write");
        write_string(&mut index, &self.entrypoint)?;
        for arg in &self.args {
            write_string(&mut index, arg)?;
        }
        let mut offset: u64 = 0;
        for (name, bytecode) in &self.files {
            write_string(&mut index, name)?;
            let size =
                u32::try_from(bytecode.len()).map_err(|_| Error::EntryTooLarge(name.clone()))?;
            let offset32 =
                u32::try_from(offset).map_err(|_| Error::EntryTooLarge(name.clone()))?;
            index.write_u32::<LittleEndian>(offset32).expect("vec write");
            index.write_u32::<LittleEndian>(size).expect("vec write");
            offset += bytecode.len() as u64;
        }
        Ok(index)
    }

    fn count(&self, n: usize, what: &str) -> Result<u16, Error> {
        u16::try_from(n)
            .ok()
            .filter(|&n| n <= MAX_COUNT)
            .ok_or_else(|| Error::EntryTooLarge(what.to_owned()))
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), Error> {
    let len = u16::try_from(s.len()).map_err(|_| Error::EntryTooLarge(s.to_owned()))?;
    out.write_u16::<LittleEndian>(len).expect("vec write");
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn fake_host(dir: &tempfile::TempDir) -> PathBuf {
        let host = dir.path().join("host-bin");
        std::fs::write(&host, b"#!ELF not really\x00padding padding").unwrap();
        host
    }

    #[test]
    fn round_trips_through_the_appended_footer() {
        let dir = tempfile::tempdir().unwrap();
        let host = fake_host(&dir);
        let out = dir.path().join("standalone");

        let mut writer = Writer::new("main");
        writer
            .preserve_arg("-Wpedantic")
            .preserve_arg("--pledge")
            .preserve_arg("fs:read")
            .add_file("main", b"\x01main bytecode".to_vec())
            .add_file("lib.util", b"\x02util bytecode bytes".to_vec());
        writer.write(&host, &out).unwrap();

        let bundle = detect(&out).unwrap().expect("bundle is present");
        assert_eq!(bundle.entrypoint, "main");
        assert_eq!(bundle.args, vec!["-Wpedantic", "--pledge", "fs:read"]);
        assert_eq!(
            bundle.file_names().collect::<Vec<_>>(),
            vec!["main", "lib.util"]
        );
        assert_eq!(bundle.get_file("main").unwrap(), b"\x01main bytecode");
        assert_eq!(
            bundle.get_file("lib.util").unwrap(),
            b"\x02util bytecode bytes"
        );
        assert!(matches!(
            bundle.get_file("missing"),
            Err(Error::UnknownFile(_))
        ));
    }

    #[test]
    fn synthesized_argv_replays_preserved_args_before_user_args() {
        let dir = tempfile::tempdir().unwrap();
        let host = fake_host(&dir);
        let out = dir.path().join("standalone");

        let mut writer = Writer::new("main");
        writer.preserve_arg("-P").preserve_arg("fs");
        writer.add_file("main", b"code".to_vec());
        writer.write(&host, &out).unwrap();

        let bundle = detect(&out).unwrap().unwrap();
        let argv = bundle.synthesized_args(
            "./standalone",
            &["x".to_owned(), "y".to_owned()],
        );
        assert_eq!(argv, vec!["./standalone", "-P", "fs", "--", "main", "x", "y"]);
    }

    #[test]
    fn plain_binaries_have_no_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let host = fake_host(&dir);
        assert!(detect(&host).unwrap().is_none());

        // Too small to even hold a trailer.
        let tiny = dir.path().join("tiny");
        std::fs::write(&tiny, b"abc").unwrap();
        assert!(detect(&tiny).unwrap().is_none());
    }

    #[test]
    fn malformed_trailers_degrade_to_no_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let host = fake_host(&dir);
        let out = dir.path().join("standalone");

        let mut writer = Writer::new("main");
        writer.add_file("main", b"code".to_vec());
        writer.write(&host, &out).unwrap();

        // Corrupt the version byte at the start of the index.
        let mut bytes = std::fs::read(&out).unwrap();
        let index_size =
            u32::from_le_bytes(bytes[bytes.len() - 8..bytes.len() - 4].try_into().unwrap())
                as usize;
        let index_start = bytes.len() - 8 - index_size;
        bytes[index_start] = 0xEE;
        std::fs::write(&out, &bytes).unwrap();
        assert!(detect(&out).unwrap().is_none());

        // An index size pointing past the file start is rejected.
        let mut bytes = std::fs::read(&out).unwrap();
        let len = bytes.len();
        bytes[len - 8..len - 4].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&out, &bytes).unwrap();
        assert!(detect(&out).unwrap().is_none());

        // A truncated index is rejected.
        let mut writer = Writer::new("main");
        writer.add_file("main", b"code".to_vec());
        writer.write(&host, &out).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        let mut truncated = bytes[..bytes.len() - 12].to_vec();
        truncated.extend_from_slice(&(index_size as u32).to_le_bytes());
        truncated.extend_from_slice(MAGIC);
        // The index bytes are now garbage cut out of the blob/index
        // boundary; parsing must fail cleanly.
        std::fs::write(&out, &truncated).unwrap();
        let _ = detect(&out).unwrap();
    }
}
