//! Firmware images to be streamed to the target.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::Path;

/// Sequential firmware reader with a known total length
pub trait FirmwareSource {
    /// Total image length in bytes
    fn length(&self) -> usize;

    /// Read the next bytes into `buf`, returning how many were read.
    /// Returns 0 once the image is exhausted.
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: AsRef<[u8]>> FirmwareSource for Cursor<T> {
    fn length(&self) -> usize {
        self.get_ref().as_ref().len()
    }

    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Any reader paired with the length it promises to deliver
pub struct ReaderSource<R> {
    reader: R,
    length: usize,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R, length: usize) -> Self {
        Self { reader, length }
    }
}

impl ReaderSource<File> {
    /// Open a firmware binary from disk
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let length = file.metadata()?.len() as usize;

        Ok(Self::new(file, length))
    }
}

impl<R: Read> FirmwareSource for ReaderSource<R> {
    fn length(&self) -> usize {
        self.length
    }

    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Fill as much of the block as the reader allows so short reads do not
        // fragment the image into undersized frames
        let mut n = 0;
        while n < buf.len() {
            match self.reader.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(r) => n += r,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }
}
