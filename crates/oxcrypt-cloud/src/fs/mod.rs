//! Name and content cryptography for vault files

pub mod file;
pub mod file_ctrmac;
pub mod name;
pub mod streaming;

// Re-export commonly used types
pub use file::{FileContext, FileDecryptionError, FileEncryptionError, FileHeader};
pub use name::{NameContext, NameEncoding, NameError, decrypt_filename, encrypt_filename, hash_dir_id};
pub use streaming::{decrypt_stream, decrypt_to_vec, encrypt_stream, encrypt_to_vec};
