use std::cell::Cell;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::rc::Rc;

use log::{debug, info};
use tar::Archive;
use tokio_util::sync::CancellationToken;
use zip::read::ZipArchive;

use super::TransferError;
use super::codec::Codec;
use crate::util::MonotonicProgress;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

impl ArchiveKind {
    /// Pick the archive format from an asset or file name.
    pub fn from_name(name: &str) -> Option<ArchiveKind> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::TarGz => ".tar.gz",
            ArchiveKind::Zip => ".zip",
        }
    }
}

/// Expand `archive_path` into `dest`, overwriting files that already exist.
///
/// Progress is per entry for zip and per compressed byte for tar.gz. Returns the
/// number of files written.
pub fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    kind: ArchiveKind,
    progress: &mut (dyn FnMut(f32) + Send),
    cancel: &CancellationToken,
) -> Result<usize, TransferError> {
    info!(
        "extract: {} into {} as {:?}",
        archive_path.display(),
        dest.display(),
        kind
    );
    fs::create_dir_all(dest)?;
    let mut gate = MonotonicProgress::new(progress);
    gate.report(0.0);
    let written = match kind {
        ArchiveKind::Zip => extract_zip(archive_path, dest, &mut gate, cancel)?,
        ArchiveKind::TarGz => extract_targz(archive_path, dest, &mut gate, cancel)?,
    };
    gate.report(1.0);
    info!("extract: wrote {written} files");
    Ok(written)
}

fn extract_zip(
    archive_path: &Path,
    dest: &Path,
    gate: &mut MonotonicProgress<'_>,
    cancel: &CancellationToken,
) -> Result<usize, TransferError> {
    let file = fs::File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| TransferError::Archive(format!("zip parse error: {e}")))?;
    let total = archive.len();
    let mut written = 0;

    for i in 0..total {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let mut entry = archive
            .by_index(i)
            .map_err(|e| TransferError::Archive(format!("zip entry error: {e}")))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            TransferError::Archive(format!("zip entry escapes destination: {}", entry.name()))
        })?;
        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out_file = fs::File::create(&out_path)?;
            io::copy(&mut entry, &mut out_file)?;
            written += 1;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode));
            }
        }
        debug!("extract: {}", out_path.display());
        gate.report((i + 1) as f32 / total as f32);
    }

    Ok(written)
}

fn extract_targz(
    archive_path: &Path,
    dest: &Path,
    gate: &mut MonotonicProgress<'_>,
    cancel: &CancellationToken,
) -> Result<usize, TransferError> {
    let file = fs::File::open(archive_path)?;
    let total = file.metadata()?.len().max(1);
    let consumed = Rc::new(Cell::new(0u64));
    let reader = CountingReader {
        inner: file,
        consumed: consumed.clone(),
    };
    let mut archive = Archive::new(Codec::Gzip.decoder(reader));
    let mut written = 0;

    let entries = archive
        .entries()
        .map_err(|e| TransferError::Archive(format!("tar.gz read error: {e}")))?;
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let mut entry =
            entry.map_err(|e| TransferError::Archive(format!("tar.gz entry error: {e}")))?;
        let is_file = entry.header().entry_type().is_file();
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| TransferError::Archive(format!("tar.gz extract error: {e}")))?;
        if !unpacked {
            let name = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(TransferError::Archive(format!(
                "tar entry escapes destination: {name}"
            )));
        }
        if is_file {
            written += 1;
        }
        gate.report(consumed.get() as f32 / total as f32);
    }

    Ok(written)
}

struct CountingReader<R> {
    inner: R,
    consumed: Rc<Cell<u64>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.consumed.set(self.consumed.get() + read as u64);
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = fs::File::create(path).expect("create zip");
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in files {
            zip.start_file(*name, SimpleFileOptions::default())
                .expect("start entry");
            zip.write_all(data).expect("write entry");
        }
        zip.finish().expect("finish zip");
    }

    #[test]
    fn picks_archive_kind_from_name() {
        assert_eq!(ArchiveKind::from_name("Server-3.10.zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_name("server.TAR.GZ"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("client.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("notes.txt"), None);
    }

    #[test]
    fn extracts_zip_and_overwrites_existing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("pkg.zip");
        write_zip(
            &archive,
            &[("BepInEx/core.dll", b"new"), ("readme.txt", b"hello")],
        );
        let dest = dir.path().join("out");
        fs::create_dir_all(dest.join("BepInEx")).expect("mkdir");
        fs::write(dest.join("BepInEx/core.dll"), b"old").expect("seed old file");

        let mut seen = Vec::new();
        let mut sink = |v: f32| seen.push(v);
        let written = extract_archive(
            &archive,
            &dest,
            ArchiveKind::Zip,
            &mut sink,
            &CancellationToken::new(),
        )
        .expect("extract");

        assert_eq!(written, 2);
        assert_eq!(fs::read(dest.join("BepInEx/core.dll")).expect("read"), b"new");
        assert_eq!(fs::read(dest.join("readme.txt")).expect("read"), b"hello");
        assert_eq!(seen.first().copied(), Some(0.0));
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[test]
    fn extracts_targz_with_byte_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("pkg.tar.gz");
        {
            let file = fs::File::create(&archive).expect("create tar.gz");
            let enc = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(enc);
            let data = b"server binary";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "bin/server", &data[..])
                .expect("append");
            builder
                .into_inner()
                .expect("finish tar")
                .finish()
                .expect("finish gzip");
        }
        let dest = dir.path().join("out");
        let mut seen = Vec::new();
        let mut sink = |v: f32| seen.push(v);

        let written = extract_archive(
            &archive,
            &dest,
            ArchiveKind::TarGz,
            &mut sink,
            &CancellationToken::new(),
        )
        .expect("extract");

        assert_eq!(written, 1);
        assert_eq!(
            fs::read(dest.join("bin/server")).expect("read"),
            b"server binary"
        );
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[test]
    fn corrupt_archive_is_an_archive_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"definitely not a zip").expect("write");
        let mut sink = |_: f32| {};
        let err = extract_archive(
            &archive,
            &dir.path().join("out"),
            ArchiveKind::Zip,
            &mut sink,
            &CancellationToken::new(),
        )
        .expect_err("corrupt archive");
        assert!(matches!(err, TransferError::Archive(_)));
    }

    #[test]
    fn cancelled_token_stops_extraction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = dir.path().join("pkg.zip");
        write_zip(&archive, &[("a.txt", b"a")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = |_: f32| {};
        let err = extract_archive(&archive, &dir.path().join("out"), ArchiveKind::Zip, &mut sink, &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, TransferError::Cancelled));
    }
}
