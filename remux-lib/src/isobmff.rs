//! ISOBMFF (MP4) box parsing and writing utilities.
//! Centralizes boilerplate for traversing and emitting MP4 structures in memory.

use crate::error::{SerializeError, TransmuxError};

/// A box located inside a buffer
#[derive(Debug, Clone, Copy)]
pub struct Mp4Box<'a> {
    pub box_type: [u8; 4],
    /// Position of the box header within the walked buffer
    pub start: usize,
    pub header_len: usize,
    pub payload: &'a [u8],
}

impl<'a> Mp4Box<'a> {
    /// Total box size, header included
    pub fn size(&self) -> usize {
        self.header_len + self.payload.len()
    }

    /// Iterate the children of a container box
    pub fn children(&self) -> BoxIter<'a> {
        BoxIter::new(self.payload)
    }
}

/// Iterator over sibling boxes. Handles 64-bit `largesize` and size 0 ("to end").
pub struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> BoxIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>, TransmuxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let data = self.data;
        let pos = self.pos;
        if pos + 8 > data.len() {
            self.failed = true;
            return Some(Err(TransmuxError::MalformedBox(format!(
                "truncated box header at {}",
                pos
            ))));
        }
        let size32 = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let box_type = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];

        let (size, header_len) = match size32 {
            0 => (data.len() - pos, 8),
            1 => {
                if pos + 16 > data.len() {
                    self.failed = true;
                    return Some(Err(TransmuxError::MalformedBox(format!(
                        "truncated largesize for '{}'",
                        String::from_utf8_lossy(&box_type)
                    ))));
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&data[pos + 8..pos + 16]);
                (u64::from_be_bytes(large) as usize, 16)
            }
            n => (n as usize, 8),
        };

        if size < header_len || size > data.len() - pos {
            self.failed = true;
            return Some(Err(TransmuxError::MalformedBox(format!(
                "'{}' at {} declares {} bytes, {} available",
                String::from_utf8_lossy(&box_type),
                pos,
                size,
                data.len() - pos
            ))));
        }

        self.pos += size;
        Some(Ok(Mp4Box {
            box_type,
            start: pos,
            header_len,
            payload: &data[pos + header_len..pos + size],
        }))
    }
}

/// Find the payload of the box at `path`, descending one container per element.
pub fn find_box<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let (first, rest) = path.split_first()?;
    let found = BoxIter::new(data)
        .map_while(|b| b.ok())
        .find(|b| &b.box_type == *first)?;
    if rest.is_empty() {
        Some(found.payload)
    } else {
        find_box(found.payload, rest)
    }
}

/// Big-endian field reader over a box payload.
/// Reads past the end yield `MalformedBox` naming the box being parsed.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            context,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], TransmuxError> {
        if self.remaining() < n {
            return Err(TransmuxError::MalformedBox(format!(
                "{}: need {} bytes at {}, have {}",
                self.context,
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), TransmuxError> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, TransmuxError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, TransmuxError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, TransmuxError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, TransmuxError> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64, TransmuxError> {
        let b = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    /// Full box version and flags
    pub fn version_flags(&mut self) -> Result<(u8, u32), TransmuxError> {
        let v = self.u32()?;
        Ok(((v >> 24) as u8, v & 0x00FF_FFFF))
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// 32-bit size field of a box with `content_len` bytes of content
fn box_size(box_type: &[u8; 4], content_len: usize) -> Result<u32, SerializeError> {
    content_len
        .checked_add(8)
        .and_then(|size| u32::try_from(size).ok())
        .ok_or_else(|| {
            SerializeError::FieldOverflow(format!(
                "'{}' box of {} bytes",
                String::from_utf8_lossy(box_type),
                content_len
            ))
        })
}

/// Write a complete box: size (u32 BE) + type + content.
pub fn write_box(box_type: &[u8; 4], content: &[u8]) -> Result<Vec<u8>, SerializeError> {
    let size = box_size(box_type, content.len())?;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    out.extend_from_slice(content);
    Ok(out)
}

/// Write a container box (size + type + children concatenated).
pub fn write_container_box(
    box_type: &[u8; 4],
    children: &[&[u8]],
) -> Result<Vec<u8>, SerializeError> {
    let children_len: usize = children.iter().map(|c| c.len()).sum();
    let size = box_size(box_type, children_len)?;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(box_type);
    for child in children {
        out.extend_from_slice(child);
    }
    Ok(out)
}

/// Full box header (version + flags)
pub fn fullbox_header(version: u8, flags: u32) -> [u8; 4] {
    (((version as u32) << 24) | (flags & 0x00FF_FFFF)).to_be_bytes()
}

/// Write a full box: header, version/flags, content.
pub fn write_full_box(
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
    content: &[u8],
) -> Result<Vec<u8>, SerializeError> {
    let mut body = Vec::with_capacity(4 + content.len());
    body.extend_from_slice(&fullbox_header(version, flags));
    body.extend_from_slice(content);
    write_box(box_type, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterate_siblings() {
        let mut data = write_box(b"ftyp", b"isom").unwrap();
        let mvhd = write_box(b"mvhd", &[0; 4]).unwrap();
        data.extend(write_container_box(b"moov", &[&mvhd]).unwrap());

        let boxes: Vec<_> = BoxIter::new(&data).collect::<Result<_, _>>().unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(&boxes[0].box_type, b"ftyp");
        assert_eq!(boxes[1].start, 12);
        assert_eq!(boxes[1].size(), 20);

        let child = boxes[1].children().next().unwrap().unwrap();
        assert_eq!(&child.box_type, b"mvhd");
    }

    #[test]
    fn test_largesize_and_size_zero() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&20u64.to_be_bytes());
        data.extend_from_slice(&[7; 4]);
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&[1, 2, 3]);

        let boxes: Vec<_> = BoxIter::new(&data).collect::<Result<_, _>>().unwrap();
        assert_eq!(boxes[0].header_len, 16);
        assert_eq!(boxes[0].payload, &[7; 4]);
        assert_eq!(boxes[1].payload, &[1, 2, 3]);
    }

    #[test]
    fn test_truncated_box_is_malformed() {
        let mut data = Vec::new();
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(b"moof");
        data.extend_from_slice(&[0; 8]);

        let result: Result<Vec<_>, _> = BoxIter::new(&data).collect();
        assert!(matches!(result, Err(TransmuxError::MalformedBox(_))));
    }

    #[test]
    fn test_find_box_path() {
        let stsz = write_box(b"stsz", &[9; 12]).unwrap();
        let stbl = write_container_box(b"stbl", &[&stsz]).unwrap();
        let trak = write_container_box(b"trak", &[&stbl]).unwrap();
        let moov = write_container_box(b"moov", &[&trak]).unwrap();
        assert_eq!(find_box(&moov, &[b"moov", b"trak", b"stbl", b"stsz"]), Some(&[9u8; 12][..]));
        assert_eq!(find_box(&moov, &[b"moov", b"mvex"]), None);
    }

    #[test]
    fn test_reader_bounds() {
        let mut r = ByteReader::new(&[0, 0, 0, 5, 1], "test");
        assert_eq!(r.u32().unwrap(), 5);
        assert_eq!(r.remaining(), 1);
        assert!(matches!(r.u16(), Err(TransmuxError::MalformedBox(_))));
    }

    #[test]
    fn test_full_box_header() {
        let b = write_full_box(b"tfdt", 1, 0x000002, &[]).unwrap();
        assert_eq!(&b[8..12], &[1, 0, 0, 2]);
        assert_eq!(b.len(), 12);
    }

    #[test]
    fn test_box_size_limit() {
        assert_eq!(box_size(b"mdat", 100).unwrap(), 108);
        assert_eq!(box_size(b"mdat", u32::MAX as usize - 8).unwrap(), u32::MAX);
        let err = box_size(b"mdat", u32::MAX as usize - 7).unwrap_err();
        assert!(matches!(err, SerializeError::FieldOverflow(_)));
        assert!(box_size(b"moov", usize::MAX).is_err());
    }
}
