//! Token streams backing vocabulary and database persistence.
//!
//! Two encodings share one logical token sequence:
//!
//! * binary: little-endian `i32`/`f32`/`f64`, preceded by a single `0x00`
//!   sentinel byte;
//! * text: ASCII tokens separated by whitespace, floats with ten fractional
//!   digits, no sentinel.
//!
//! Because every text token starts with a printable character, the first byte
//! of a file decides the encoding: values below 32 mean binary.

use std::fs::File;
use std::io::{BufRead, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// On-disk encoding of a vocabulary or database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Binary,
    Text,
}

/// Inspect the first byte of `path` to tell binary from text files.
pub fn detect_format(path: &Path) -> Result<FileFormat> {
    let mut file = File::open(path)?;
    let mut first = [0u8; 1];
    let n = file.read(&mut first)?;
    if n == 0 {
        return Err(Error::MalformedFile("empty file".into()));
    }
    Ok(if first[0] < 32 {
        FileFormat::Binary
    } else {
        FileFormat::Text
    })
}

/// Sink of persistence tokens.
pub trait TokenWrite {
    /// Emit the format sentinel, where the encoding has one.
    fn put_magic(&mut self) -> Result<()>;
    fn put_i32(&mut self, v: i32) -> Result<()>;
    fn put_f32(&mut self, v: f32) -> Result<()>;
    fn put_f64(&mut self, v: f64) -> Result<()>;
    /// Flush buffered output.
    fn finish(&mut self) -> Result<()>;
}

/// Source of persistence tokens.
pub trait TokenRead {
    /// Consume the format sentinel, where the encoding has one.
    fn skip_magic(&mut self) -> Result<()>;
    fn next_i32(&mut self) -> Result<i32>;
    fn next_f32(&mut self) -> Result<f32>;
    fn next_f64(&mut self) -> Result<f64>;
}

/// Little-endian fixed-width token writer.
pub struct BinaryWriter<W: Write> {
    inner: W,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> TokenWrite for BinaryWriter<W> {
    fn put_magic(&mut self) -> Result<()> {
        self.inner.write_all(&[0u8])?;
        Ok(())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn put_f32(&mut self, v: f32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn put_f64(&mut self, v: f64) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Little-endian fixed-width token reader.
pub struct BinaryReader<R: Read> {
    inner: R,
}

impl<R: Read> BinaryReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn fill<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::MalformedFile("unexpected end of stream".into())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }
}

impl<R: Read> TokenRead for BinaryReader<R> {
    fn skip_magic(&mut self) -> Result<()> {
        let _ = self.fill::<1>()?;
        Ok(())
    }

    fn next_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.fill::<4>()?))
    }

    fn next_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.fill::<4>()?))
    }

    fn next_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.fill::<8>()?))
    }
}

/// Whitespace-separated ASCII token writer.
pub struct TextWriter<W: Write> {
    inner: W,
}

impl<W: Write> TextWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> TokenWrite for TextWriter<W> {
    fn put_magic(&mut self) -> Result<()> {
        // text files are recognized by their printable first byte
        Ok(())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        write!(self.inner, "{v} ")?;
        Ok(())
    }

    fn put_f32(&mut self, v: f32) -> Result<()> {
        write!(self.inner, "{v:.10} ")?;
        Ok(())
    }

    fn put_f64(&mut self, v: f64) -> Result<()> {
        write!(self.inner, "{v:.10} ")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        writeln!(self.inner)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Whitespace-separated ASCII token reader.
pub struct TextReader<R: BufRead> {
    inner: R,
}

impl<R: BufRead> TextReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn next_token(&mut self) -> Result<String> {
        let mut token = String::new();
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let mut consumed = 0;
            let mut done = false;
            for &b in buf {
                consumed += 1;
                if b.is_ascii_whitespace() {
                    if !token.is_empty() {
                        done = true;
                        break;
                    }
                } else {
                    token.push(b as char);
                }
            }
            self.inner.consume(consumed);
            if done {
                break;
            }
        }
        if token.is_empty() {
            Err(Error::MalformedFile("unexpected end of stream".into()))
        } else {
            Ok(token)
        }
    }
}

impl<R: BufRead> TokenRead for TextReader<R> {
    fn skip_magic(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_i32(&mut self) -> Result<i32> {
        let token = self.next_token()?;
        token
            .parse()
            .map_err(|_| Error::MalformedFile(format!("expected integer, got `{token}`")))
    }

    fn next_f32(&mut self) -> Result<f32> {
        let token = self.next_token()?;
        token
            .parse()
            .map_err(|_| Error::MalformedFile(format!("expected float, got `{token}`")))
    }

    fn next_f64(&mut self) -> Result<f64> {
        let token = self.next_token()?;
        token
            .parse()
            .map_err(|_| Error::MalformedFile(format!("expected float, got `{token}`")))
    }
}
