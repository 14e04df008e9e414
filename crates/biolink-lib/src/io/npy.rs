//! Minimal NPY (numpy array file, format 1.0) codec for the array kinds a run
//! archive holds: a u16 sample table, fixed-width byte strings and the
//! `(frame_nr, event_str)` structured event table.

use crate::signal::EventRecord;
use thiserror::Error;

const MAGIC: &[u8] = b"\x93NUMPY";
const ALIGNMENT: usize = 64;

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("malformed NPY data: {0}")]
    Format(String),
    #[error("unsupported dtype '{0}'")]
    Dtype(String),
    #[error("frame index {0} does not fit the u32 frame column")]
    FrameRange(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub descr: String,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

fn shape_literal(shape: &[usize]) -> String {
    match shape {
        [single] => format!("({},)", single),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Magic, version and the padded header dictionary. `descr` is inserted
/// verbatim, so simple dtypes must come quoted.
fn header_bytes(descr: &str, shape: &[usize]) -> Vec<u8> {
    let mut dict = format!(
        "{{'descr': {}, 'fortran_order': False, 'shape': {}, }}",
        descr,
        shape_literal(shape)
    );
    let unpadded = MAGIC.len() + 4 + dict.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + dict.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out
}

/// Split an NPY file into its header and raw payload.
pub fn parse(bytes: &[u8]) -> Result<(NpyHeader, &[u8]), NpyError> {
    if bytes.len() < MAGIC.len() + 4 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(NpyError::Format("missing NPY magic".into()));
    }
    let major = bytes[MAGIC.len()];
    let (header_len, offset) = match major {
        1 => {
            let raw = [bytes[8], bytes[9]];
            (u16::from_le_bytes(raw) as usize, 10)
        }
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(NpyError::Format("truncated header length".into()));
            }
            let raw = [bytes[8], bytes[9], bytes[10], bytes[11]];
            (u32::from_le_bytes(raw) as usize, 12)
        }
        other => return Err(NpyError::Format(format!("unknown version {}", other))),
    };
    let end = offset + header_len;
    if bytes.len() < end {
        return Err(NpyError::Format("truncated header".into()));
    }
    let text = std::str::from_utf8(&bytes[offset..end])
        .map_err(|_| NpyError::Format("header is not text".into()))?;
    let header = parse_header(text)?;
    Ok((header, &bytes[end..]))
}

fn parse_header(text: &str) -> Result<NpyHeader, NpyError> {
    let descr_at = text
        .find("'descr':")
        .ok_or_else(|| NpyError::Format("no descr".into()))?;
    let rest = text[descr_at + "'descr':".len()..].trim_start();
    let descr = if let Some(stripped) = rest.strip_prefix('\'') {
        let close = stripped
            .find('\'')
            .ok_or_else(|| NpyError::Format("unterminated descr".into()))?;
        stripped[..close].to_string()
    } else if rest.starts_with('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| NpyError::Format("unterminated descr list".into()))?;
        rest[..=close].to_string()
    } else {
        return Err(NpyError::Format("descr is neither string nor list".into()));
    };

    let fortran_order = text.contains("'fortran_order': True");

    let shape_at = text
        .find("'shape':")
        .ok_or_else(|| NpyError::Format("no shape".into()))?;
    let rest = &text[shape_at + "'shape':".len()..];
    let open = rest
        .find('(')
        .ok_or_else(|| NpyError::Format("shape is not a tuple".into()))?;
    let close = rest
        .find(')')
        .ok_or_else(|| NpyError::Format("unterminated shape".into()))?;
    let shape = rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpyError::Format(format!("bad dimension '{}'", dim)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NpyHeader {
        descr,
        fortran_order,
        shape,
    })
}

/// `(kind, width)` of a byte (`S`) or unicode (`U`) string dtype.
fn string_dtype(dtype: &str) -> Option<(char, usize)> {
    let trimmed = dtype.trim_start_matches(['|', '<', '=']);
    let mut chars = trimmed.chars();
    let kind = chars.next().filter(|c| *c == 'S' || *c == 'U')?;
    let width = chars.as_str().parse().ok()?;
    Some((kind, width))
}

fn quoted_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let at = text.find(key)? + key.len();
    let rest = &text[at..];
    let open = rest.find('\'')? + 1;
    let close = rest[open..].find('\'')? + open;
    Some(&rest[open..close])
}

fn decode_fixed_bytes(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|b| *b != 0).map_or(0, |idx| idx + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn decode_fixed_unicode(raw: &[u8]) -> String {
    raw.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .take_while(|code| *code != 0)
        .filter_map(char::from_u32)
        .collect()
}

fn expect_fortran_free(header: &NpyHeader) -> Result<(), NpyError> {
    if header.fortran_order {
        return Err(NpyError::Format("fortran-ordered arrays are not supported".into()));
    }
    Ok(())
}

fn payload(data: &[u8], len: usize) -> Result<&[u8], NpyError> {
    data.get(..len).ok_or_else(|| {
        NpyError::Format(format!("payload holds {} bytes, expected {}", data.len(), len))
    })
}

/// Row-major `frames x channels` table of little-endian u16.
pub fn encode_u16_table(frames: usize, channels: usize, values: &[u16]) -> Vec<u8> {
    let mut out = header_bytes("'<u2'", &[frames, channels]);
    out.reserve(values.len() * 2);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Returns `(frames, channels, values)`.
pub fn decode_u16_table(bytes: &[u8]) -> Result<(usize, usize, Vec<u16>), NpyError> {
    let (header, data) = parse(bytes)?;
    expect_fortran_free(&header)?;
    if header.descr != "<u2" {
        return Err(NpyError::Dtype(header.descr));
    }
    let (frames, channels) = match header.shape.as_slice() {
        [frames, channels] => (*frames, *channels),
        other => {
            return Err(NpyError::Format(format!(
                "expected a 2-d table, got shape {:?}",
                other
            )))
        }
    };
    let raw = payload(data, frames * channels * 2)?;
    let values = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok((frames, channels, values))
}

/// One-dimensional array of fixed-width byte strings.
pub fn encode_strings(items: &[String]) -> Vec<u8> {
    let width = items.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
    let mut out = header_bytes(&format!("'|S{}'", width), &[items.len()]);
    for item in items {
        let mut field = vec![0u8; width];
        field[..item.len()].copy_from_slice(item.as_bytes());
        out.extend_from_slice(&field);
    }
    out
}

/// Accepts byte (`S`) and numpy unicode (`U`) string arrays.
pub fn decode_strings(bytes: &[u8]) -> Result<Vec<String>, NpyError> {
    let (header, data) = parse(bytes)?;
    expect_fortran_free(&header)?;
    let (kind, width) =
        string_dtype(&header.descr).ok_or_else(|| NpyError::Dtype(header.descr.clone()))?;
    let count = match header.shape.as_slice() {
        [count] => *count,
        other => {
            return Err(NpyError::Format(format!(
                "expected a 1-d array, got shape {:?}",
                other
            )))
        }
    };
    let item_size = if kind == 'U' { width * 4 } else { width };
    if item_size == 0 {
        return Ok(vec![String::new(); count]);
    }
    let raw = payload(data, count * item_size)?;
    Ok(raw
        .chunks_exact(item_size)
        .map(|item| {
            if kind == 'U' {
                decode_fixed_unicode(item)
            } else {
                decode_fixed_bytes(item)
            }
        })
        .collect())
}

/// Structured `[('frame_nr', '<u4'), ('event_str', '|S<width>')]` table.
pub fn encode_events(events: &[EventRecord], width: usize) -> Result<Vec<u8>, NpyError> {
    let descr = format!("[('frame_nr', '<u4'), ('event_str', '|S{}')]", width);
    let mut out = header_bytes(&descr, &[events.len()]);
    for event in events {
        let frame = u32::try_from(event.frame).map_err(|_| NpyError::FrameRange(event.frame))?;
        out.extend_from_slice(&frame.to_le_bytes());
        let text = crate::signal::truncate_event_text(&event.text, width);
        let mut field = vec![0u8; width];
        field[..text.len()].copy_from_slice(text.as_bytes());
        out.extend_from_slice(&field);
    }
    Ok(out)
}

/// Returns the records and the text column width.
pub fn decode_events(bytes: &[u8]) -> Result<(Vec<EventRecord>, usize), NpyError> {
    let (header, data) = parse(bytes)?;
    expect_fortran_free(&header)?;
    let frame_dtype = quoted_after(&header.descr, "'frame_nr'")
        .ok_or_else(|| NpyError::Dtype(header.descr.clone()))?;
    if frame_dtype != "<u4" {
        return Err(NpyError::Dtype(header.descr.clone()));
    }
    let (_, width) = quoted_after(&header.descr, "'event_str'")
        .and_then(string_dtype)
        .filter(|(kind, _)| *kind == 'S')
        .ok_or_else(|| NpyError::Dtype(header.descr.clone()))?;
    let count = match header.shape.as_slice() {
        [count] => *count,
        other => {
            return Err(NpyError::Format(format!(
                "expected a 1-d event table, got shape {:?}",
                other
            )))
        }
    };
    let record = 4 + width;
    let raw = payload(data, count * record)?;
    let events = raw
        .chunks_exact(record)
        .map(|item| EventRecord {
            frame: u32::from_le_bytes([item[0], item[1], item[2], item[3]]) as u64,
            text: decode_fixed_bytes(&item[4..]),
        })
        .collect();
    Ok((events, width))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_aligned_and_newline_terminated() {
        let bytes = encode_u16_table(3, 2, &[1, 2, 3, 4, 5, 6]);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(bytes.len(), 10 + header_len + 12);
    }

    #[test]
    fn parses_numpy_written_headers() {
        let header =
            parse_header("{'descr': '<u2', 'fortran_order': False, 'shape': (60000, 3), }   \n")
                .unwrap();
        assert_eq!(header.descr, "<u2");
        assert_eq!(header.shape, vec![60000, 3]);
        let header = parse_header(
            "{'descr': [('frame_nr', '<u4'), ('event_str', 'S16')], 'fortran_order': False, 'shape': (0,), }",
        )
        .unwrap();
        assert_eq!(header.shape, vec![0]);
        assert_eq!(quoted_after(&header.descr, "'event_str'"), Some("S16"));
    }

    #[test]
    fn reads_numpy_unicode_string_arrays() {
        let mut bytes = header_bytes("'<U3'", &[2]);
        for word in ["ecg", "ed"] {
            let mut chars: Vec<u32> = word.chars().map(|c| c as u32).collect();
            chars.resize(3, 0);
            for c in chars {
                bytes.extend_from_slice(&c.to_le_bytes());
            }
        }
        assert_eq!(decode_strings(&bytes).unwrap(), vec!["ecg", "ed"]);
    }

    #[test]
    fn event_frames_beyond_u32_are_rejected() {
        let events = vec![EventRecord {
            frame: u64::from(u32::MAX) + 1,
            text: "x".into(),
        }];
        assert!(matches!(
            encode_events(&events, 16),
            Err(NpyError::FrameRange(_))
        ));
    }

    #[test]
    fn empty_event_table_decodes() {
        let bytes = encode_events(&[], 32).unwrap();
        let (events, width) = decode_events(&bytes).unwrap();
        assert!(events.is_empty());
        assert_eq!(width, 32);
    }

    #[test]
    fn rejects_foreign_data() {
        assert!(parse(b"PK\x03\x04not npy").is_err());
        let table = encode_u16_table(1, 1, &[7]);
        assert!(decode_strings(&table).is_err());
    }
}
