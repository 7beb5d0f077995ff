//! Chunked content encryption over `Read`/`Write` streams.
//!
//! A ciphertext file is the encrypted header followed by the encrypted
//! chunks, chunk `n` holding cleartext bytes `n * 32768 ..`. Empty files are
//! header only. Both cipher combos share this layout and differ only in the
//! header and per-chunk overhead reported by the [`Cryptor`].

use std::io::{self, Read, Write};

use tracing::{debug, instrument, trace};

use crate::cloud::{Progress, ProgressAware, ProgressState};
use crate::crypto::Cryptor;
use crate::fs::file::{FileContext, FileDecryptionError, FileEncryptionError};

/// Fill `buffer` from `reader`, stopping early only at end of stream.
fn read_full(reader: &mut dyn Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt `cleartext` into `sink`, returning the number of ciphertext bytes written.
///
/// `length` is the announced cleartext length and only drives progress
/// reporting; the stream is encrypted until it ends.
#[instrument(level = "debug", skip_all, fields(length))]
pub fn encrypt_stream(
    cryptor: &dyn Cryptor,
    cleartext: &mut dyn Read,
    sink: &mut dyn Write,
    length: u64,
    progress: &dyn ProgressAware,
    context: &FileContext,
) -> Result<u64, FileEncryptionError> {
    let io_error = |e: io::Error| FileEncryptionError::io_with_context(e, context.clone());
    let total = cryptor.ciphertext_file_size(length);

    let header = cryptor.create_header();
    let encrypted_header = cryptor.encrypt_header(&header, context)?;
    sink.write_all(&encrypted_header).map_err(io_error)?;
    let mut written = encrypted_header.len() as u64;
    progress.on_progress(Progress::new(ProgressState::Encryption, written, Some(total)));

    let mut buffer = vec![0u8; cryptor.cleartext_chunk_size()];
    let mut chunk_number = 0u64;
    loop {
        let n = read_full(cleartext, &mut buffer).map_err(io_error)?;
        if n == 0 {
            break;
        }
        let chunk = cryptor.encrypt_chunk(&buffer[..n], chunk_number, &header, context)?;
        sink.write_all(&chunk).map_err(io_error)?;
        written += chunk.len() as u64;
        trace!(chunk = chunk_number, size = chunk.len(), "Encrypted chunk");
        progress.on_progress(Progress::new(ProgressState::Encryption, written, Some(total)));

        chunk_number += 1;
        if n < buffer.len() {
            break;
        }
    }
    sink.flush().map_err(io_error)?;

    debug!(chunks = chunk_number, written, "Encryption complete");
    Ok(written)
}

/// Decrypt a ciphertext stream into `sink`, returning the number of cleartext bytes written.
///
/// `cleartext_size` is only used for progress reporting and may be unknown.
#[instrument(level = "debug", skip_all, fields(cleartext_size))]
pub fn decrypt_stream(
    cryptor: &dyn Cryptor,
    ciphertext: &mut dyn Read,
    sink: &mut dyn Write,
    cleartext_size: Option<u64>,
    progress: &dyn ProgressAware,
    context: &FileContext,
) -> Result<u64, FileDecryptionError> {
    let io_error = |e: io::Error| FileDecryptionError::io_with_context(e, context.clone());

    let mut header_bytes = vec![0u8; cryptor.header_size()];
    let n = read_full(ciphertext, &mut header_bytes).map_err(io_error)?;
    if n < header_bytes.len() {
        return Err(FileDecryptionError::InvalidHeader {
            reason: format!("expected {} bytes, got {n} bytes", header_bytes.len()),
            context: context.clone(),
        });
    }
    let header = cryptor.decrypt_header(&header_bytes, context)?;
    progress.on_progress(Progress::new(ProgressState::Decryption, 0, cleartext_size));

    let mut buffer = vec![0u8; cryptor.ciphertext_chunk_size()];
    let mut chunk_number = 0u64;
    let mut written = 0u64;
    loop {
        let n = read_full(ciphertext, &mut buffer).map_err(io_error)?;
        if n == 0 {
            break;
        }
        let cleartext = cryptor.decrypt_chunk(&buffer[..n], chunk_number, &header, context)?;
        sink.write_all(&cleartext).map_err(io_error)?;
        written += cleartext.len() as u64;
        trace!(chunk = chunk_number, size = cleartext.len(), "Decrypted chunk");
        progress.on_progress(Progress::new(ProgressState::Decryption, written, cleartext_size));

        chunk_number += 1;
        if n < buffer.len() {
            break;
        }
    }
    sink.flush().map_err(io_error)?;

    debug!(chunks = chunk_number, written, "Decryption complete");
    Ok(written)
}

/// Encrypt a small in-memory payload such as a directory ID backup.
pub fn encrypt_to_vec(
    cryptor: &dyn Cryptor,
    cleartext: &[u8],
    context: &FileContext,
) -> Result<Vec<u8>, FileEncryptionError> {
    let mut out = Vec::with_capacity(cryptor.ciphertext_file_size(cleartext.len() as u64) as usize);
    let mut reader = cleartext;
    encrypt_stream(
        cryptor,
        &mut reader,
        &mut out,
        cleartext.len() as u64,
        &crate::cloud::NoProgress,
        context,
    )?;
    Ok(out)
}

/// Decrypt a small in-memory ciphertext file.
pub fn decrypt_to_vec(
    cryptor: &dyn Cryptor,
    ciphertext: &[u8],
    context: &FileContext,
) -> Result<Vec<u8>, FileDecryptionError> {
    let mut out = Vec::new();
    let mut reader = ciphertext;
    let size = cryptor.cleartext_file_size(ciphertext.len() as u64);
    decrypt_stream(cryptor, &mut reader, &mut out, size, &crate::cloud::NoProgress, context)?;
    Ok(out)
}
