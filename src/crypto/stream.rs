//! Block-streaming adapters over arbitrary byte sinks and sources.
//!
//! Both adapters run raw CBC without padding. The writer holds back any
//! trailing partial block; callers push filler through it so the real data
//! leaves in whole blocks. The reader only pulls as many ciphertext blocks
//! from its source as the plaintext requested so far needs, so it never reads
//! past the data the caller asked for.

use super::{Aes128CbcDec, Aes128CbcEnc, Cipher, BLOCK_SIZE};
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encrypts everything written through it onto `inner`
pub struct EncryptingWriter<'a, W> {
    inner: &'a mut W,
    encryptor: Aes128CbcEnc,
    pending: Vec<u8>,
}

impl<'a, W> EncryptingWriter<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: &'a mut W, cipher: &Cipher) -> Self {
        Self {
            inner,
            encryptor: cipher.encryptor(),
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Encrypt and forward every complete block; keep the remainder buffered
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(data);
        let whole = self.pending.len() / BLOCK_SIZE * BLOCK_SIZE;
        if whole == 0 {
            return Ok(());
        }

        let mut out: Vec<u8> = self.pending.drain(..whole).collect();
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            self.encryptor
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.inner.write_all(&out).await
    }

    /// Bytes still waiting for a full block
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}

/// Decrypts bytes pulled from `inner`
pub struct DecryptingReader<'a, R> {
    inner: &'a mut R,
    decryptor: Aes128CbcDec,
    plain: Vec<u8>,
    pos: usize,
}

impl<'a, R> DecryptingReader<'a, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: &'a mut R, cipher: &Cipher) -> Self {
        Self {
            inner,
            decryptor: cipher.decryptor(),
            plain: Vec::new(),
            pos: 0,
        }
    }

    /// Fill `buf` with up to `buf.len()` plaintext bytes
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pos >= self.plain.len() {
            let blocks = buf.len().div_ceil(BLOCK_SIZE);
            let mut block_buf = vec![0u8; blocks * BLOCK_SIZE];
            self.inner.read_exact(&mut block_buf).await?;
            for block in block_buf.chunks_exact_mut(BLOCK_SIZE) {
                self.decryptor
                    .decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            self.plain = block_buf;
            self.pos = 0;
        }

        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read(&mut buf[filled..]).await?;
        }
        Ok(())
    }
}
