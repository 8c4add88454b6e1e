//! Upload archive codec: gzip-compressed cpio records
//!
//! Writes the portable "odc" format (76-byte ASCII octal header, no alignment padding,
//! `TRAILER!!!` terminator, output padded to 512-byte blocks). Reads odc and the
//! `newc`/`crc` variants, since those are what peers emit in practice.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::entity::Entity;

const MAGIC_ODC: &str = "070707";
const MAGIC_NEWC: &[u8; 6] = b"070701";
const MAGIC_CRC: &[u8; 6] = b"070702";
const TRAILER: &str = "TRAILER!!!";

const ODC_HEADER_LEN: usize = 76;
const NEWC_HEADER_LEN: usize = 110;
const BLOCK_SIZE: u64 = 512;
const MAX_NAME_LEN: u64 = 4096;

/// Largest value an 11-digit octal field holds.
pub const MAX_ENTRY_SIZE: u64 = 0o77777777777;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
/// Regular file, owner read/write, group and other read.
pub const FILE_MODE: u32 = S_IFREG | 0o644;

/// Read adapter reporting every consumed chunk before handing it on.
pub struct CountingReader<R, F> {
    inner: R,
    on_read: F,
}

impl<R: Read, F: FnMut(u64)> CountingReader<R, F> {
    pub fn new(inner: R, on_read: F) -> Self {
        Self { inner, on_read }
    }
}

impl<R: Read, F: FnMut(u64)> Read for CountingReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            (self.on_read)(n as u64);
        }
        Ok(n)
    }
}

/// Streaming odc writer.
pub struct CpioWriter<W: Write> {
    inner: W,
    written: u64,
    next_ino: u64,
    mtime: u64,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W, mtime: u64) -> Self {
        Self { inner, written: 0, next_ino: 1, mtime }
    }

    /// Append one regular file record. `data` must yield at least `size` bytes.
    pub fn append(&mut self, path: &str, size: u64, data: &mut dyn Read) -> io::Result<()> {
        let ino = self.next_ino & 0o777777;
        self.next_ino += 1;
        self.write_header(ino, FILE_MODE, path, size)?;
        let copied = io::copy(&mut data.take(size), &mut self.inner)?;
        self.written += copied;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{path}: source ended after {copied} of {size} bytes"),
            ));
        }
        Ok(())
    }

    /// Write the trailer record and block padding, returning the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_header(0, 0, TRAILER, 0)?;
        let tail = self.written % BLOCK_SIZE;
        if tail != 0 {
            let pad = vec![0u8; (BLOCK_SIZE - tail) as usize];
            self.inner.write_all(&pad)?;
            self.written += pad.len() as u64;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_header(&mut self, ino: u64, mode: u32, name: &str, size: u64) -> io::Result<()> {
        if size > MAX_ENTRY_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name}: {size} bytes does not fit a cpio record"),
            ));
        }
        let namesize = name.len() as u64 + 1;
        if namesize > 0o777777 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "archive path too long"));
        }
        let header = format!(
            "{}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:011o}{:06o}{:011o}",
            MAGIC_ODC,
            0, // dev
            ino,
            mode,
            0, // uid
            0, // gid
            1, // nlink
            0, // rdev
            self.mtime,
            namesize,
            size,
        );
        debug_assert_eq!(header.len(), ODC_HEADER_LEN);
        self.inner.write_all(header.as_bytes())?;
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(&[0])?;
        self.written += ODC_HEADER_LEN as u64 + namesize;
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Pack `entities` in order into a gzip-compressed archive written to `sink`.
///
/// Every chunk read from an entity is reported through `on_read` before it is written.
/// Entities of unknown size are buffered fully first, since records are size-prefixed.
pub fn pack<W: Write>(
    entities: &[Arc<dyn Entity>],
    sink: W,
    on_read: &mut dyn FnMut(u64),
) -> io::Result<W> {
    let gz = GzEncoder::new(sink, Compression::default());
    let mut cpio = CpioWriter::new(gz, now_secs());
    for entity in entities {
        let mut src = CountingReader::new(entity.open()?, &mut *on_read);
        match entity.size() {
            Some(size) => cpio.append(entity.path(), size, &mut src)?,
            None => {
                let mut content = Vec::new();
                src.read_to_end(&mut content)?;
                cpio.append(entity.path(), content.len() as u64, &mut content.as_slice())?;
            }
        }
    }
    cpio.finish()?.finish()
}

#[derive(Debug, Clone)]
struct Header {
    name: String,
    mode: u32,
    size: u64,
    /// Alignment after the file data (newc only).
    data_align: u64,
}

impl Header {
    fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn parse_field(field: &[u8], radix: u32) -> io::Result<u64> {
    let s = std::str::from_utf8(field).map_err(|_| invalid("non-ascii cpio header"))?;
    u64::from_str_radix(s, radix).map_err(|_| invalid(format!("bad cpio header field {s:?}")))
}

fn read_exact_or_truncated<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            io::Error::new(io::ErrorKind::UnexpectedEof, "archive truncated before trailer")
        } else {
            e
        }
    })
}

fn skip<R: Read>(r: &mut R, n: u64) -> io::Result<()> {
    let skipped = io::copy(&mut r.take(n), &mut io::sink())?;
    if skipped != n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "archive truncated"));
    }
    Ok(())
}

fn pad4(n: u64) -> u64 {
    (4 - n % 4) % 4
}

/// Reads the next record header, `None` at the trailer.
fn next_header<R: Read>(r: &mut R) -> io::Result<Option<Header>> {
    let mut magic = [0u8; 6];
    read_exact_or_truncated(r, &mut magic)?;
    let (mode, namesize, size, name_align, data_align) = if &magic[..] == MAGIC_ODC.as_bytes() {
        let mut h = [0u8; ODC_HEADER_LEN - 6];
        read_exact_or_truncated(r, &mut h)?;
        // dev ino mode uid gid nlink rdev (6 each), mtime (11), namesize (6), filesize (11)
        let mode = parse_field(&h[12..18], 8)? as u32;
        let namesize = parse_field(&h[53..59], 8)?;
        let size = parse_field(&h[59..70], 8)?;
        (mode, namesize, size, false, false)
    } else if &magic == MAGIC_NEWC || &magic == MAGIC_CRC {
        let mut h = [0u8; NEWC_HEADER_LEN - 6];
        read_exact_or_truncated(r, &mut h)?;
        // ino mode uid gid nlink mtime filesize devmaj devmin rdevmaj rdevmin namesize check
        let field = |i: usize| parse_field(&h[i * 8..i * 8 + 8], 16);
        (field(1)? as u32, field(11)?, field(6)?, true, true)
    } else {
        return Err(invalid(format!("bad cpio magic {:?}", String::from_utf8_lossy(&magic))));
    };

    if namesize == 0 || namesize > MAX_NAME_LEN {
        return Err(invalid(format!("bad cpio name length {namesize}")));
    }
    let mut name = vec![0u8; namesize as usize];
    read_exact_or_truncated(r, &mut name)?;
    if name.last() == Some(&0) {
        name.pop();
    }
    if name_align {
        skip(r, pad4(NEWC_HEADER_LEN as u64 + namesize))?;
    }
    let name = String::from_utf8(name).map_err(|_| invalid("non-utf8 archive path"))?;
    if name == TRAILER {
        return Ok(None);
    }
    let data_align = if data_align { pad4(size) } else { 0 };
    Ok(Some(Header { name, mode, size, data_align }))
}

/// Decompress `source` and hand each regular-file record whose path is in `allowed` to
/// `on_file` as `(path, size, reader over exactly that record)`. Other records are skipped.
/// Bytes the callback leaves unread are drained before the next record.
pub fn unpack<R, F>(source: R, allowed: &HashSet<String>, mut on_file: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(&str, u64, &mut dyn Read) -> io::Result<()>,
{
    let mut gz = GzDecoder::new(source);
    while let Some(header) = next_header(&mut gz)? {
        let mut body = (&mut gz).take(header.size);
        if header.is_regular() && allowed.contains(&header.name) {
            on_file(&header.name, header.size, &mut body)?;
        }
        io::copy(&mut body, &mut io::sink())?;
        if body.limit() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: record truncated", header.name),
            ));
        }
        skip(&mut gz, header.data_align)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MemoryEntity;
    use proptest::prelude::*;

    fn unpack_all(bytes: &[u8], allowed: &HashSet<String>) -> io::Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        unpack(bytes, allowed, |path, size, r| {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            assert_eq!(buf.len() as u64, size);
            out.push((path.to_string(), buf));
            Ok(())
        })?;
        Ok(out)
    }

    #[test]
    fn odc_header_layout() -> io::Result<()> {
        let mut w = CpioWriter::new(Vec::new(), 0o12345);
        w.append("./a.txt", 3, &mut &b"abc"[..])?;
        let out = w.finish()?;
        assert_eq!(out.len(), 512);
        assert_eq!(&out[..ODC_HEADER_LEN], b"0707070000000000011006440000000000000000010000000000001234500001000000000003");
        assert_eq!(&out[ODC_HEADER_LEN..ODC_HEADER_LEN + 8], b"./a.txt\0");
        assert_eq!(&out[ODC_HEADER_LEN + 8..ODC_HEADER_LEN + 11], b"abc");
        let trailer = &out[ODC_HEADER_LEN + 11..];
        assert!(trailer.starts_with(b"070707000000000000000000"));
        assert_eq!(&trailer[ODC_HEADER_LEN..ODC_HEADER_LEN + 11], b"TRAILER!!!\0");
        assert!(trailer[ODC_HEADER_LEN + 11..].iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn oversized_record_rejected() {
        let mut w = CpioWriter::new(Vec::new(), 0);
        let err = w.append("./big", MAX_ENTRY_SIZE + 1, &mut io::empty()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn short_source_is_an_error() {
        let mut w = CpioWriter::new(Vec::new(), 0);
        let err = w.append("./short", 10, &mut &b"abc"[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unknown_size_is_buffered_and_counted() -> io::Result<()> {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(MemoryEntity::new("a.bin", "application/octet-stream", data.clone()).r#unsized()),
            Arc::new(MemoryEntity::new("b.txt", "text/plain", b"hello".to_vec())),
        ];
        let mut seen = 0u64;
        let packed = pack(&entities, Vec::new(), &mut |n| seen += n)?;
        assert_eq!(seen, data.len() as u64 + 5);

        let allowed: HashSet<String> = ["./a.bin".to_string(), "./b.txt".to_string()].into();
        let files = unpack_all(&packed, &allowed)?;
        assert_eq!(files[0], ("./a.bin".to_string(), data));
        assert_eq!(files[1], ("./b.txt".to_string(), b"hello".to_vec()));
        Ok(())
    }

    #[test]
    fn unread_bytes_are_drained() -> io::Result<()> {
        let entities: Vec<Arc<dyn Entity>> = vec![
            Arc::new(MemoryEntity::new("a", "text/plain", vec![7; 4096])),
            Arc::new(MemoryEntity::new("b", "text/plain", vec![9; 10])),
        ];
        let packed = pack(&entities, Vec::new(), &mut |_| {})?;
        let allowed: HashSet<String> = ["./a".to_string(), "./b".to_string()].into();
        let mut got = Vec::new();
        unpack(&packed[..], &allowed, |path, _, r| {
            let mut one = [0u8; 1];
            r.read_exact(&mut one)?;
            got.push((path.to_string(), one[0]));
            Ok(())
        })?;
        assert_eq!(got, vec![("./a".to_string(), 7), ("./b".to_string(), 9)]);
        Ok(())
    }

    #[test]
    fn truncated_stream_fails() -> io::Result<()> {
        let entities: Vec<Arc<dyn Entity>> =
            vec![Arc::new(MemoryEntity::new("a", "text/plain", (0..=255u8).cycle().take(50_000).collect()))];
        let packed = pack(&entities, Vec::new(), &mut |_| {})?;
        let allowed: HashSet<String> = ["./a".to_string()].into();
        let cut = &packed[..packed.len() / 2];
        assert!(unpack_all(cut, &allowed).is_err());
        Ok(())
    }

    #[test]
    fn missing_trailer_fails() -> io::Result<()> {
        // Valid gzip, but the cpio stream stops after the first record.
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut w = CpioWriter::new(Vec::new(), 0);
        w.append("./a", 1, &mut &b"x"[..])?;
        let raw = w.inner;
        gz.write_all(&raw)?;
        let packed = gz.finish()?;
        let allowed: HashSet<String> = ["./a".to_string()].into();
        let err = unpack_all(&packed, &allowed).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        Ok(())
    }

    #[test]
    fn garbage_magic_fails() -> io::Result<()> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&[b'x'; 200])?;
        let packed = gz.finish()?;
        let err = unpack_all(&packed, &HashSet::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        Ok(())
    }

    #[test]
    fn reads_newc_records() -> io::Result<()> {
        fn newc(name: &str, mode: u32, data: &[u8]) -> Vec<u8> {
            let mut out = format!(
                "070701{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
                1, mode, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, name.len() + 1, 0
            )
            .into_bytes();
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            while out.len() % 4 != 0 {
                out.push(0);
            }
            out.extend_from_slice(data);
            while out.len() % 4 != 0 {
                out.push(0);
            }
            out
        }
        let mut raw = newc("./dir", 0o040755, b"");
        raw.extend(newc("./dir/x.txt", FILE_MODE, b"hello"));
        raw.extend(newc(TRAILER, 0, b""));
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&raw)?;
        let packed = gz.finish()?;
        let allowed: HashSet<String> = ["./dir".to_string(), "./dir/x.txt".to_string()].into();
        let files = unpack_all(&packed, &allowed)?;
        assert_eq!(files, vec![("./dir/x.txt".to_string(), b"hello".to_vec())]);
        Ok(())
    }

    proptest! {
        #[test]
        fn pack_unpack_preserves_content_and_order(
            files in proptest::collection::vec(
                (proptest::collection::vec(any::<u8>(), 0..4096), any::<bool>(), any::<bool>()),
                1..8,
            )
        ) {
            let entities: Vec<Arc<dyn Entity>> = files
                .iter()
                .enumerate()
                .map(|(i, (data, sized, _))| {
                    let e = MemoryEntity::new(&format!("f{i}.bin"), "application/octet-stream", data.clone());
                    Arc::new(if *sized { e } else { e.r#unsized() }) as Arc<dyn Entity>
                })
                .collect();
            let packed = pack(&entities, Vec::new(), &mut |_| {}).unwrap();

            let allowed: HashSet<String> = files
                .iter()
                .enumerate()
                .filter(|(_, (_, _, keep))| *keep)
                .map(|(i, _)| format!("./f{i}.bin"))
                .collect();
            let got = unpack_all(&packed, &allowed).unwrap();
            let expected: Vec<(String, Vec<u8>)> = files
                .iter()
                .enumerate()
                .filter(|(_, (_, _, keep))| *keep)
                .map(|(i, (data, _, _))| (format!("./f{i}.bin"), data.clone()))
                .collect();
            prop_assert_eq!(got, expected);
        }
    }
}
