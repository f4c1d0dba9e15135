//! Streaming archive encryption.
//!
//! File layout: `BKPENC01` magic, a 7-byte random nonce prefix, then frames of
//! `flag: u8 | len: u32 LE | AES-256-GCM ciphertext`. Each frame seals up to 64 KiB
//! of plaintext under nonce `prefix || counter (u32 BE) || flag`; `flag` is 1 only on
//! the final frame, so truncation and reordering fail authentication. The 15-byte
//! header is bound to every frame as associated data.
//!
//! Nothing here touches the database or the server: decryption only needs the file,
//! the backup id and the master key.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::CryptoError;

pub const MAGIC: &[u8; 8] = b"BKPENC01";
const NONCE_PREFIX_LEN: usize = 7;
const HEADER_LEN: usize = MAGIC.len() + NONCE_PREFIX_LEN;
pub const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;

/// Process-wide secret all per-backup keys are derived from.
#[derive(Clone)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CryptoError::MissingKey);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// HKDF-SHA256 with the backup id as salt.
pub fn derive_key(master: &MasterKey, backup_id: &str) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(backup_id.as_bytes()), &master.0);
    let mut okm = [0u8; 32];
    hk.expand(&[], &mut okm)
        .map_err(|e| CryptoError::Encryption(format!("key derivation failed: {e}")))?;
    Ok(okm)
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..11].copy_from_slice(&counter.to_be_bytes());
    nonce[11] = last as u8;
    nonce
}

fn decryption(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, CryptoError::Decryption(msg.into()))
}

fn find_crypto<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a CryptoError> {
    if let Some(c) = err.downcast_ref::<CryptoError>() {
        return Some(c);
    }
    // io::Error::source() skips its own payload, so look inside explicitly.
    if let Some(inner) = err.downcast_ref::<io::Error>().and_then(|e| e.get_ref()) {
        if let Some(c) = find_crypto(inner) {
            return Some(c);
        }
    }
    err.source().and_then(find_crypto)
}

/// Recovers a `CryptoError` that travelled through (possibly wrapped) `io::Error`s.
fn from_io(e: io::Error) -> CryptoError {
    let found = match find_crypto(&e) {
        Some(CryptoError::Decryption(m)) => Some(CryptoError::Decryption(m.clone())),
        Some(CryptoError::Encryption(m)) => Some(CryptoError::Encryption(m.clone())),
        Some(CryptoError::MissingKey) => Some(CryptoError::MissingKey),
        Some(CryptoError::Io(_)) | None => None,
    };
    found.unwrap_or(CryptoError::Io(e))
}

pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_LEN],
    header: [u8; HEADER_LEN],
    counter: u32,
    buf: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(mut inner: W, key: &[u8; 32]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut prefix);
        let mut header = [0u8; HEADER_LEN];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[MAGIC.len()..].copy_from_slice(&prefix);
        inner.write_all(&header)?;
        Ok(Self {
            inner,
            cipher,
            prefix,
            header,
            counter: 0,
            buf: Vec::with_capacity(CHUNK_SIZE),
        })
    }

    fn seal(&mut self, plaintext: &[u8], last: bool) -> io::Result<()> {
        let nonce = chunk_nonce(&self.prefix, self.counter, last);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.header,
                },
            )
            .map_err(|_| io::Error::other(CryptoError::Encryption("seal failed".into())))?;
        self.inner.write_all(&[last as u8])?;
        self.inner.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.counter = self.counter.checked_add(1).ok_or_else(|| {
            io::Error::other(CryptoError::Encryption("stream too long".into()))
        })?;
        Ok(())
    }

    /// Seals the final frame and hands back the inner writer.
    pub fn finish(mut self) -> Result<W, CryptoError> {
        let rest = std::mem::take(&mut self.buf);
        self.seal(&rest, true).map_err(from_io)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        // Keep at least one byte back so the final frame is known when finish() runs.
        while self.buf.len() > CHUNK_SIZE {
            let chunk: Vec<u8> = self.buf.drain(..CHUNK_SIZE).collect();
            self.seal(&chunk, false)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct DecryptingReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    prefix: [u8; NONCE_PREFIX_LEN],
    header: [u8; HEADER_LEN],
    counter: u32,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(mut inner: R, key: &[u8; 32]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        let mut header = [0u8; HEADER_LEN];
        inner.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => CryptoError::Decryption("file too short".into()),
            _ => CryptoError::Io(e),
        })?;
        if &header[..MAGIC.len()] != MAGIC {
            return Err(CryptoError::Decryption("not an encrypted backup".into()));
        }
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&header[MAGIC.len()..]);
        Ok(Self {
            inner,
            cipher,
            prefix,
            header,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    fn read_frame(&mut self) -> io::Result<()> {
        let mut head = [0u8; 5];
        self.inner.read_exact(&mut head).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => decryption("truncated ciphertext"),
            _ => e,
        })?;
        let last = match head[0] {
            0 => false,
            1 => true,
            _ => return Err(decryption("bad frame flag")),
        };
        let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(decryption("bad frame length"));
        }
        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => decryption("truncated ciphertext"),
            _ => e,
        })?;

        let nonce = chunk_nonce(&self.prefix, self.counter, last);
        self.plain = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &self.header,
                },
            )
            .map_err(|_| decryption("authentication failed (wrong key or tampered data)"))?;
        self.pos = 0;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| decryption("stream too long"))?;

        if last {
            let mut extra = [0u8; 1];
            if self.inner.read(&mut extra)? != 0 {
                return Err(decryption("trailing data after final frame"));
            }
            self.done = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.read_frame()?;
        }
        let n = out.len().min(self.plain.len() - self.pos);
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn write_archive(src_dir: &Path, file: File, key: &[u8; 32]) -> Result<(), CryptoError> {
    let enc = EncryptingWriter::new(BufWriter::new(file), key)?;
    let gz = GzEncoder::new(enc, Compression::default());
    let mut builder = tar::Builder::new(gz);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src_dir)?;
    let gz = builder.into_inner()?;
    let enc = gz.finish()?;
    let writer = enc.finish()?;
    let file = writer.into_inner().map_err(|e| CryptoError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

/// Tars, gzips and encrypts `src_dir` into `out`. `out` appears only once complete.
pub fn encrypt_directory(
    src_dir: &Path,
    out: &Path,
    backup_id: &str,
    master: &MasterKey,
) -> Result<u64, CryptoError> {
    let key = derive_key(master, backup_id)?;
    let partial = partial_path(out);
    let result = File::create(&partial)
        .map_err(CryptoError::from)
        .and_then(|file| write_archive(src_dir, file, &key))
        .and_then(|()| fs::rename(&partial, out).map_err(CryptoError::from));
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    Ok(fs::metadata(out)?.len())
}

/// Reverses the encryption layer, writing the `.tar.gz` payload to `output`.
///
/// `output` is only created once every frame has authenticated.
pub fn decrypt_file(
    input: &Path,
    output: &Path,
    backup_id: &str,
    master: &MasterKey,
) -> Result<u64, CryptoError> {
    let key = derive_key(master, backup_id)?;
    let mut reader = DecryptingReader::new(BufReader::new(File::open(input)?), &key)?;
    let partial = partial_path(output);

    let result = (|| {
        let mut out = BufWriter::new(File::create(&partial)?);
        let n = io::copy(&mut reader, &mut out).map_err(from_io)?;
        out.into_inner()
            .map_err(|e| CryptoError::Io(e.into_error()))?
            .sync_all()?;
        fs::rename(&partial, output)?;
        Ok::<_, CryptoError>(n)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

/// Decrypts and unpacks an archive into `out_dir`, which must not exist yet.
pub fn extract_archive(
    input: &Path,
    out_dir: &Path,
    backup_id: &str,
    master: &MasterKey,
) -> Result<(), CryptoError> {
    if out_dir.exists() {
        return Err(CryptoError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", out_dir.display()),
        )));
    }
    let key = derive_key(master, backup_id)?;
    let reader = DecryptingReader::new(BufReader::new(File::open(input)?), &key)?;
    let staging = partial_path(out_dir);

    let result = (|| {
        fs::create_dir_all(&staging)?;
        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        archive.unpack(&staging).map_err(from_io)?;
        // Drain so a tampered tail is still caught after tar's end marker.
        let mut rest = archive.into_inner();
        io::copy(&mut rest, &mut io::sink()).map_err(from_io)?;
        fs::rename(&staging, out_dir)?;
        Ok::<_, CryptoError>(())
    })();
    if result.is_err() {
        let _ = fs::remove_dir_all(&staging);
    }
    result
}
