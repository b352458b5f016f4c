//! Stream Cipher
//!
//! Optional wrapping of the raw socket byte streams. The transport only needs
//! something that turns a writer into an encrypting writer and a reader into
//! a decrypting reader; both peers must be configured with the same cipher.

use std::io::{self, Read, Write};

/// Boxed writer handed to the outbound queue
pub type BoxWrite = Box<dyn Write + Send>;

/// Boxed reader handed to the read loop
pub type BoxRead = Box<dyn Read + Send>;

/// Wraps byte streams with encrypt/decrypt semantics
pub trait Cipher: Send + Sync {
    /// Wrap an output stream so bytes written through it are encrypted
    fn encrypt(&self, output: BoxWrite) -> BoxWrite;

    /// Wrap an input stream so bytes read through it are decrypted
    fn decrypt(&self, input: BoxRead) -> BoxRead;
}

/// XOR keystream cipher keyed by a shared passphrase
///
/// The keystream is a xorshift64* sequence seeded from the CRC32 of the
/// passphrase. This obscures traffic; it is not a substitute for TLS.
#[derive(Debug, Clone)]
pub struct XorCipher {
    seed: u64,
}

impl XorCipher {
    pub fn new(passphrase: &str) -> Self {
        let crc = crc32fast::hash(passphrase.as_bytes()) as u64;
        // xorshift must never be seeded with zero
        let seed = (crc << 32 | (crc ^ 0x9E37_79B9)) | 1;
        Self { seed }
    }
}

impl Cipher for XorCipher {
    fn encrypt(&self, output: BoxWrite) -> BoxWrite {
        Box::new(XorWriter {
            inner: output,
            keystream: Keystream::new(self.seed),
        })
    }

    fn decrypt(&self, input: BoxRead) -> BoxRead {
        Box::new(XorReader {
            inner: input,
            keystream: Keystream::new(self.seed),
        })
    }
}

struct Keystream {
    state: u64,
    block: [u8; 8],
    index: usize,
}

impl Keystream {
    fn new(seed: u64) -> Self {
        Self {
            state: seed,
            block: [0; 8],
            index: 8,
        }
    }

    fn next_byte(&mut self) -> u8 {
        if self.index == 8 {
            self.state ^= self.state >> 12;
            self.state ^= self.state << 25;
            self.state ^= self.state >> 27;
            self.block = self.state.wrapping_mul(0x2545_F491_4F6C_DD1D).to_le_bytes();
            self.index = 0;
        }
        let b = self.block[self.index];
        self.index += 1;
        b
    }

    fn apply(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b ^= self.next_byte();
        }
    }
}

struct XorWriter {
    inner: BoxWrite,
    keystream: Keystream,
}

impl Write for XorWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Keystream position advances per byte, so everything must reach the
        // inner writer; write_all keeps the two in step.
        let mut scrambled = buf.to_vec();
        self.keystream.apply(&mut scrambled);
        self.inner.write_all(&scrambled)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct XorReader {
    inner: BoxRead,
    keystream: Keystream,
}

impl Read for XorReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.keystream.apply(&mut buf[..n]);
        Ok(n)
    }
}
