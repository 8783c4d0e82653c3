//! Seekable view over a forward-only byte source.
//!
//! Every byte pulled from the source is spooled to a backing buffer (an
//! anonymous temp file by default), so earlier positions can be revisited
//! without rewinding the source. Seeking forward past what has been spooled
//! drains the source into the buffer in fixed-size chunks.
//!
//! State, with `buffer_length == source_position` at all times here:
//!
//! ```text
//!   0          cursor        buffer_length/source_position      total_length
//!   |------------^-------------------|---------------------------------|
//!   [  spooled in backing buffer    ][    not yet read from source    ]
//! ```

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

/// Chunk size used when draining the source to satisfy a seek.
pub const CHUNK_SIZE: usize = 8192;

/// Reference point for [`SeekableStream::seek_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Begin,
    Current,
    End,
}

pub struct SeekableStream<R, B = File> {
    source: R,
    backing: B,
    total_length: u64,
    /// Bytes consumed from the source; never decreases.
    source_position: u64,
    /// Bytes held in the backing buffer, always a prefix of the stream.
    buffer_length: u64,
    /// Logical read position.
    cursor: u64,
    /// Where the backing buffer's own handle currently points.
    backing_position: u64,
    chunk_size: usize,
    /// Set once a backing buffer operation fails. Bytes already taken from
    /// the source may be missing from the buffer, so every later read and
    /// seek reports this instead.
    fault: Option<(io::ErrorKind, String)>,
}

impl<R: Read> SeekableStream<R, File> {
    /// Wrap `source`, which is declared to hold exactly `total_length` bytes,
    /// spooling to an anonymous temp file that the OS removes on close.
    pub fn new(source: R, total_length: u64) -> Result<Self> {
        Ok(Self::with_backing(source, total_length, tempfile::tempfile()?))
    }
}

impl<R: Read, B: Read + Write + Seek> SeekableStream<R, B> {
    /// Wrap `source` with a caller-provided, initially empty backing buffer.
    pub fn with_backing(source: R, total_length: u64, backing: B) -> Self {
        Self {
            source,
            backing,
            total_length,
            source_position: 0,
            buffer_length: 0,
            cursor: 0,
            backing_position: 0,
            chunk_size: CHUNK_SIZE,
            fault: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Declared total length, fixed at construction.
    pub fn len(&self) -> u64 {
        self.total_length
    }

    pub fn is_empty(&self) -> bool {
        self.total_length == 0
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Same as seeking to `position` from the beginning.
    pub fn set_position(&mut self, position: u64) -> Result<u64> {
        let offset = i64::try_from(position)
            .map_err(|_| Error::OutOfRange(format!("position {position} exceeds i64")))?;
        self.seek_to(offset, SeekOrigin::Begin)
    }

    /// Bytes spooled into the backing buffer so far.
    pub fn buffered_len(&self) -> u64 {
        self.buffer_length
    }

    /// Bytes consumed from the underlying source so far.
    pub fn source_position(&self) -> u64 {
        self.source_position
    }

    /// Move the cursor. Fails with `OutOfRange`, leaving the cursor where it
    /// was, if the target falls outside `0..=len()`. An `End` offset must be
    /// zero or negative.
    ///
    /// Once the backing buffer has failed, every seek and read returns that
    /// failure.
    pub fn seek_to(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        self.check_fault()?;
        let total = i128::from(self.total_length);
        let target = match origin {
            SeekOrigin::Begin => i128::from(offset),
            SeekOrigin::Current => i128::from(self.cursor) + i128::from(offset),
            SeekOrigin::End => {
                if offset > 0 {
                    return Err(Error::OutOfRange(format!(
                        "offset {offset} from end must not be positive"
                    )));
                }
                total + i128::from(offset)
            }
        };

        if target < 0 || target > total {
            return Err(Error::OutOfRange(format!(
                "seek target {target} outside 0..={total}"
            )));
        }

        let target = target as u64;
        self.fill_to(target)?;
        self.cursor = target;
        Ok(target)
    }

    /// Read up to `count` bytes from the cursor. Returns fewer only at the
    /// end of the stream; an empty vector once the cursor reaches `len()`.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            let n = self.read_into(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Soft reset: rewind to the start, keeping the source and everything
    /// spooled so far. The stream can be read again afterwards.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Hard release: close the source and drop the backing buffer with its
    /// storage. The temp-file backing is unlinked by the OS once closed.
    pub fn release(mut self) -> Result<()> {
        self.backing.flush()?;
        drop(self.source);
        drop(self.backing);
        Ok(())
    }

    /// Whether the backing buffer failed earlier.
    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    fn check_fault(&self) -> Result<()> {
        match &self.fault {
            Some((kind, message)) => Err(Error::Io(io::Error::new(
                *kind,
                format!("backing buffer failed earlier: {message}"),
            ))),
            None => Ok(()),
        }
    }

    /// Latch a backing buffer failure.
    fn latch<T>(&mut self, result: io::Result<T>) -> Result<T> {
        result.map_err(|e| {
            self.fault = Some((e.kind(), e.to_string()));
            Error::Io(e)
        })
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_fault()?;
        if buf.is_empty() || self.cursor >= self.total_length {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.total_length - self.cursor) as usize;
        let buf = &mut buf[..want];

        let mut filled = 0;
        if self.cursor < self.buffer_length {
            let available = ((self.buffer_length - self.cursor) as usize).min(want);
            let read = self
                .move_backing(self.cursor)
                .and_then(|()| self.backing.read_exact(&mut buf[..available]));
            self.latch(read)?;
            self.backing_position += available as u64;
            self.cursor += available as u64;
            filled = available;
            if filled == want {
                return Ok(filled);
            }
        }

        debug_assert_eq!(self.cursor, self.buffer_length);
        let pulled = self.pull_from_source(&mut buf[filled..])?;
        self.cursor += pulled as u64;
        Ok(filled + pulled)
    }

    /// Drain the source into the backing buffer until it covers `target`.
    fn fill_to(&mut self, target: u64) -> Result<()> {
        if target <= self.buffer_length {
            return Ok(());
        }

        let mut chunk = vec![0u8; self.chunk_size];
        while self.buffer_length < target {
            let remaining = self.total_length - self.source_position;
            let len = (self.chunk_size as u64).min(remaining) as usize;
            if len == 0 || self.pull_from_source(&mut chunk[..len])? == 0 {
                return Err(Error::SourceExhausted {
                    expected: target,
                    available: self.buffer_length,
                });
            }
        }
        Ok(())
    }

    /// One read from the source at `source_position`, appended to the backing
    /// buffer. Returns the number of bytes read (0 at source EOF).
    fn pull_from_source(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = loop {
            match self.source.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Ok(0);
        }

        let written = self
            .move_backing(self.buffer_length)
            .and_then(|()| self.backing.write_all(&buf[..n]));
        self.latch(written)?;
        self.backing_position += n as u64;
        self.buffer_length += n as u64;
        self.source_position += n as u64;
        Ok(n)
    }

    /// Point the backing handle at `target`, seeking relative to where it is
    /// now or from the start, whichever offset is smaller.
    fn move_backing(&mut self, target: u64) -> io::Result<()> {
        if target == self.backing_position {
            return Ok(());
        }
        let delta = i128::from(target) - i128::from(self.backing_position);
        if delta.unsigned_abs() < u128::from(target) {
            self.backing.seek(SeekFrom::Current(delta as i64))?;
        } else {
            self.backing.seek(SeekFrom::Start(target))?;
        }
        self.backing_position = target;
        Ok(())
    }
}

impl<R: Read, B: Read + Write + Seek> Read for SeekableStream<R, B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf).map_err(io::Error::from)
    }
}

impl<R: Read, B: Read + Write + Seek> Seek for SeekableStream<R, B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = match pos {
            SeekFrom::Start(n) => self.set_position(n),
            SeekFrom::Current(n) => self.seek_to(n, SeekOrigin::Current),
            SeekFrom::End(n) => self.seek_to(n, SeekOrigin::End),
        };
        result.map_err(io::Error::from)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Forward-only source that counts the bytes handed out.
    struct CountingSource {
        inner: Cursor<Vec<u8>>,
        consumed: Arc<AtomicU64>,
    }

    impl CountingSource {
        fn new(data: Vec<u8>) -> (Self, Arc<AtomicU64>) {
            let consumed = Arc::new(AtomicU64::new(0));
            (
                Self {
                    inner: Cursor::new(data),
                    consumed: Arc::clone(&consumed),
                },
                consumed,
            )
        }
    }

    impl Read for CountingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.consumed.fetch_add(n as u64, Ordering::SeqCst);
            Ok(n)
        }
    }

    /// In-memory backing that records every seek it receives.
    #[derive(Default)]
    struct RecordingBacking {
        inner: Cursor<Vec<u8>>,
        seeks: Vec<SeekFrom>,
    }

    impl Read for RecordingBacking {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for RecordingBacking {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for RecordingBacking {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.seeks.push(pos);
            self.inner.seek(pos)
        }
    }

    #[test]
    fn full_read_then_rewind_reads_identical_bytes() {
        let data = pattern(20_000);
        let (source, consumed) = CountingSource::new(data.clone());
        let mut stream = SeekableStream::new(source, data.len() as u64).unwrap();

        let mut positions = Vec::new();
        let mut first = Vec::new();
        loop {
            let chunk = stream.read_bytes(3000).unwrap();
            positions.push(stream.source_position());
            if chunk.is_empty() {
                break;
            }
            first.extend(chunk);
        }
        assert_eq!(first, data);

        assert_eq!(stream.seek_to(0, SeekOrigin::Begin).unwrap(), 0);
        positions.push(stream.source_position());

        let mut second = Vec::new();
        stream.read_to_end(&mut second).unwrap();
        positions.push(stream.source_position());

        assert_eq!(second, first);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(consumed.load(Ordering::SeqCst), data.len() as u64);
    }

    #[test]
    fn seek_spools_in_chunks_and_read_continues_from_source() {
        let data = pattern(24_576);
        let (source, _) = CountingSource::new(data.clone());
        let mut stream = SeekableStream::new(source, 24_576).unwrap();

        assert_eq!(stream.seek_to(10_000, SeekOrigin::Begin).unwrap(), 10_000);
        assert!(stream.buffered_len() > 8192);
        assert!(stream.buffered_len() <= 16_384);

        let bytes = stream.read_bytes(8192).unwrap();
        assert_eq!(bytes.as_slice(), &data[10_000..18_192]);
        assert_eq!(stream.position(), 18_192);
    }

    #[test]
    fn backward_seeks_are_served_from_the_buffer() {
        let data = pattern(4096);
        let (source, consumed) = CountingSource::new(data.clone());
        let mut stream = SeekableStream::new(source, 4096).unwrap();

        stream.seek_to(1000, SeekOrigin::Begin).unwrap();
        let after_first = consumed.load(Ordering::SeqCst);

        assert_eq!(stream.seek_to(600, SeekOrigin::Begin).unwrap(), 600);
        assert_eq!(stream.seek_to(700, SeekOrigin::Begin).unwrap(), 700);
        assert_eq!(stream.seek_to(600, SeekOrigin::Begin).unwrap(), 600);

        assert_eq!(consumed.load(Ordering::SeqCst), after_first);
        assert_eq!(stream.read_bytes(10).unwrap().as_slice(), &data[600..610]);
        assert_eq!(consumed.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn out_of_range_seeks_leave_cursor_unchanged() {
        let (source, _) = CountingSource::new(pattern(100));
        let mut stream = SeekableStream::new(source, 100).unwrap();
        stream.seek_to(40, SeekOrigin::Begin).unwrap();

        for (offset, origin) in [
            (101, SeekOrigin::Begin),
            (-1, SeekOrigin::Begin),
            (-41, SeekOrigin::Current),
            (61, SeekOrigin::Current),
            (1, SeekOrigin::End),
            (-101, SeekOrigin::End),
        ] {
            let err = stream.seek_to(offset, origin).unwrap_err();
            assert!(matches!(err, Error::OutOfRange(_)), "{offset} {origin:?}: {err:?}");
            assert_eq!(stream.position(), 40);
        }
    }

    #[test]
    fn seek_relative_to_end_and_current() {
        let data = pattern(100);
        let (source, _) = CountingSource::new(data.clone());
        let mut stream = SeekableStream::new(source, 100).unwrap();

        assert_eq!(stream.seek_to(-10, SeekOrigin::End).unwrap(), 90);
        assert_eq!(stream.seek_to(-30, SeekOrigin::Current).unwrap(), 60);
        assert_eq!(stream.read_bytes(5).unwrap().as_slice(), &data[60..65]);
        assert_eq!(stream.seek_to(0, SeekOrigin::End).unwrap(), 100);
    }

    #[test]
    fn read_at_end_returns_nothing() {
        let (source, _) = CountingSource::new(pattern(50));
        let mut stream = SeekableStream::new(source, 50).unwrap();
        stream.seek_to(0, SeekOrigin::End).unwrap();

        assert!(stream.read_bytes(10).unwrap().is_empty());
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn reads_never_go_past_declared_length() {
        let data = pattern(64);
        let (source, consumed) = CountingSource::new(data.clone());
        let mut stream = SeekableStream::new(source, 32).unwrap();

        assert_eq!(stream.read_bytes(100).unwrap().as_slice(), &data[..32]);
        assert_eq!(consumed.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn position_setter_matches_seek_from_begin() {
        let data = pattern(300);
        let (source, _) = CountingSource::new(data.clone());
        let mut stream = SeekableStream::new(source, 300).unwrap();

        assert_eq!(stream.set_position(250).unwrap(), 250);
        assert_eq!(stream.position(), 250);
        assert!(stream.set_position(301).is_err());
        assert_eq!(stream.len(), 300);
    }

    #[test]
    fn reset_rewinds_without_releasing() {
        let data = pattern(500);
        let (source, consumed) = CountingSource::new(data.clone());
        let mut stream = SeekableStream::new(source, 500).unwrap();

        let mut first = Vec::new();
        stream.read_to_end(&mut first).unwrap();
        stream.reset();
        assert_eq!(stream.position(), 0);

        let mut second = Vec::new();
        stream.read_to_end(&mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(consumed.load(Ordering::SeqCst), 500);

        stream.release().unwrap();
    }

    #[test]
    fn short_source_is_reported_when_seeking_past_its_data() {
        let (source, _) = CountingSource::new(pattern(100));
        let mut stream = SeekableStream::new(source, 1000).unwrap();

        let err = stream.seek_to(500, SeekOrigin::Begin).unwrap_err();
        assert!(matches!(
            err,
            Error::SourceExhausted {
                expected: 500,
                available: 100
            }
        ));
    }

    #[test]
    fn std_seek_maps_out_of_range_to_invalid_input() {
        let (source, _) = CountingSource::new(pattern(10));
        let mut stream = SeekableStream::new(source, 10).unwrap();
        let err = stream.seek(SeekFrom::Start(11)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(stream.seek(SeekFrom::End(-2)).unwrap(), 8);
    }

    /// Backing buffer whose `fail_on`-th write fails.
    struct FailingBacking {
        inner: Cursor<Vec<u8>>,
        writes: usize,
        fail_on: usize,
    }

    impl Read for FailingBacking {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for FailingBacking {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            if self.writes == self.fail_on {
                return Err(io::Error::other("disk full"));
            }
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingBacking {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn failed_backing_write_poisons_the_stream() {
        let data = pattern(90);
        let (source, _) = CountingSource::new(data.clone());
        let backing = FailingBacking {
            inner: Cursor::default(),
            writes: 0,
            fail_on: 2,
        };
        let mut stream = SeekableStream::with_backing(source, 90, backing);

        assert_eq!(stream.read_bytes(10).unwrap().as_slice(), &data[..10]);
        assert!(matches!(stream.read_bytes(10), Err(Error::Io(_))));
        assert!(stream.is_faulted());

        // The lost bytes must never be papered over with later ones.
        let err = stream.read_bytes(10).unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");
        assert!(matches!(stream.seek_to(0, SeekOrigin::Begin), Err(Error::Io(_))));
        let mut rest = Vec::new();
        assert!(stream.read_to_end(&mut rest).is_err());
        assert!(rest.is_empty());
    }

    #[test]
    fn backing_seeks_pick_the_shorter_offset() {
        let data = pattern(2000);
        let (source, _) = CountingSource::new(data.clone());
        let mut stream =
            SeekableStream::with_backing(source, 2000, RecordingBacking::default());

        stream.read_bytes(1000).unwrap();
        stream.seek_to(990, SeekOrigin::Begin).unwrap();
        assert_eq!(stream.read_bytes(5).unwrap().as_slice(), &data[990..995]);

        stream.seek_to(10, SeekOrigin::Begin).unwrap();
        assert_eq!(stream.read_bytes(5).unwrap().as_slice(), &data[10..15]);

        assert_eq!(
            stream.backing.seeks,
            vec![SeekFrom::Current(-10), SeekFrom::Start(10)]
        );
    }
}
