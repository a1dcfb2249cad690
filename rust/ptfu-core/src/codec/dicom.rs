// rust/ptfu-core/src/codec/dicom.rs

//! Minimal DICOM Part-10 pixel reader.
//!
//! Handles little-endian files with explicit or implicit VR and native
//! (uncompressed) pixel data. Sequences of undefined length are skipped.

use bytes::Bytes;
use nom::bytes::complete::{tag, take};
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{le_u16, le_u32};
use nom::IResult;

use super::Decoder;
use crate::error::{DatasetError, Result};
use crate::record::{NdArray, Record};

const PREAMBLE_LEN: usize = 128;
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

type Tag = (u16, u16);

const TRANSFER_SYNTAX: Tag = (0x0002, 0x0010);
const SAMPLES_PER_PIXEL: Tag = (0x0028, 0x0002);
const PHOTOMETRIC: Tag = (0x0028, 0x0004);
const ROWS: Tag = (0x0028, 0x0010);
const COLUMNS: Tag = (0x0028, 0x0011);
const BITS_ALLOCATED: Tag = (0x0028, 0x0100);
const PIXEL_REPRESENTATION: Tag = (0x0028, 0x0103);
const PIXEL_DATA: Tag = (0x7FE0, 0x0010);

const ITEM_GROUP: u16 = 0xFFFE;
const ITEM: Tag = (ITEM_GROUP, 0xE000);
const ITEM_END: Tag = (ITEM_GROUP, 0xE00D);
const SEQUENCE_END: Tag = (ITEM_GROUP, 0xE0DD);

// VRs with a 2-byte reserved field and a 32-bit length.
const LONG_VRS: [&[u8; 2]; 13] = [
    b"OB", b"OW", b"OF", b"SQ", b"UT", b"UN", b"OD", b"OL", b"UC", b"UR", b"OV", b"SV", b"UV",
];

/// DICOM members, decoded to `f32` pixel arrays.
///
/// `MONOCHROME1` images are negated so that larger values are brighter.
#[derive(Debug, Clone, Copy, Default)]
pub struct DicomDecoder;

struct Element<'a> {
    tag: Tag,
    // None when the element had undefined length and was skipped.
    value: Option<&'a [u8]>,
}

fn fail<T>(input: &[u8], kind: ErrorKind) -> IResult<&[u8], T> {
    Err(nom::Err::Error(NomError::new(input, kind)))
}

fn header(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = take(PREAMBLE_LEN)(input)?;
    let (input, _) = tag(&b"DICM"[..])(input)?;
    Ok((input, ()))
}

fn element_tag(input: &[u8]) -> IResult<&[u8], Tag> {
    let (input, group) = le_u16(input)?;
    let (input, element) = le_u16(input)?;
    Ok((input, (group, element)))
}

fn element(input: &[u8], explicit: bool) -> IResult<&[u8], Element<'_>> {
    let (input, tag) = element_tag(input)?;

    let (input, len) = if explicit && tag.0 != ITEM_GROUP {
        let (input, vr) = take(2usize)(input)?;
        if LONG_VRS.iter().any(|long| &long[..] == vr) {
            let (input, _) = take(2usize)(input)?;
            le_u32(input)?
        } else {
            let (input, len) = le_u16(input)?;
            (input, u32::from(len))
        }
    } else {
        le_u32(input)?
    };

    if len == UNDEFINED_LENGTH {
        let (input, ()) = skip_sequence(input, explicit)?;
        return Ok((input, Element { tag, value: None }));
    }

    let (input, value) = take(len as usize)(input)?;
    Ok((
        input,
        Element {
            tag,
            value: Some(value),
        },
    ))
}

// Skips items up to and including the sequence delimiter.
fn skip_sequence(mut input: &[u8], explicit: bool) -> IResult<&[u8], ()> {
    loop {
        let (rest, tag) = element_tag(input)?;
        let (rest, len) = le_u32(rest)?;
        input = rest;
        match tag {
            SEQUENCE_END => return Ok((input, ())),
            ITEM if len == UNDEFINED_LENGTH => {
                input = skip_item(input, explicit)?.0;
            }
            ITEM => {
                input = take(len as usize)(input)?.0;
            }
            _ => return fail(input, ErrorKind::Tag),
        }
    }
}

// Skips the elements of an undefined-length item.
fn skip_item(mut input: &[u8], explicit: bool) -> IResult<&[u8], ()> {
    loop {
        let (_, tag) = element_tag(input)?;
        if tag == ITEM_END {
            let (rest, _) = take(8usize)(input)?;
            return Ok((rest, ()));
        }
        input = element(input, explicit)?.0;
    }
}

#[derive(Debug, Default)]
struct PixelModule<'a> {
    transfer_syntax: Option<String>,
    rows: usize,
    columns: usize,
    samples: usize,
    bits_allocated: u16,
    signed: bool,
    photometric: String,
    pixels: Option<&'a [u8]>,
    encapsulated: bool,
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

fn us(value: &[u8]) -> Option<u16> {
    value.get(..2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn parse(data: &[u8]) -> std::result::Result<PixelModule<'_>, String> {
    let (mut input, ()) = header(data).map_err(|_| "missing DICM preamble".to_string())?;

    let mut module = PixelModule {
        samples: 1,
        bits_allocated: 16,
        ..PixelModule::default()
    };
    let mut explicit = true;
    let mut in_meta = true;

    while !input.is_empty() {
        if in_meta && us(input) != Some(0x0002) {
            in_meta = false;
            explicit = match module.transfer_syntax.as_deref() {
                Some(EXPLICIT_VR_LE) => true,
                Some(IMPLICIT_VR_LE) | None => false,
                Some(other) => return Err(format!("unsupported transfer syntax {other}")),
            };
        }

        let offset = data.len() - input.len();
        let (rest, el) = element(input, explicit)
            .map_err(|_| format!("malformed element at offset {offset}"))?;
        input = rest;

        let Some(value) = el.value else {
            if el.tag == PIXEL_DATA {
                module.encapsulated = true;
                break;
            }
            continue;
        };

        match el.tag {
            TRANSFER_SYNTAX => module.transfer_syntax = Some(text(value)),
            SAMPLES_PER_PIXEL => module.samples = us(value).map_or(1, usize::from),
            PHOTOMETRIC => module.photometric = text(value),
            ROWS => module.rows = us(value).map_or(0, usize::from),
            COLUMNS => module.columns = us(value).map_or(0, usize::from),
            BITS_ALLOCATED => module.bits_allocated = us(value).unwrap_or(16),
            PIXEL_REPRESENTATION => module.signed = us(value) == Some(1),
            PIXEL_DATA => {
                module.pixels = Some(value);
                break;
            }
            _ => {}
        }
    }

    Ok(module)
}

fn pixels_to_f32(module: &PixelModule<'_>, raw: &[u8]) -> std::result::Result<Vec<f32>, String> {
    let count = module.rows * module.columns * module.samples.max(1);
    let width = usize::from(module.bits_allocated / 8);
    if width == 0 || raw.len() < count * width {
        return Err(format!(
            "pixel data holds {} bytes, {count} samples of {} bits need more",
            raw.len(),
            module.bits_allocated
        ));
    }

    let raw = &raw[..count * width];
    let values = match (module.bits_allocated, module.signed) {
        (8, false) => raw.iter().map(|&b| f32::from(b)).collect(),
        (8, true) => raw.iter().map(|&b| f32::from(b as i8)).collect(),
        (16, false) => raw
            .chunks_exact(2)
            .map(|c| f32::from(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        (16, true) => raw
            .chunks_exact(2)
            .map(|c| f32::from(i16::from_le_bytes([c[0], c[1]])))
            .collect(),
        (32, false) => raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        (32, true) => raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        (bits, _) => return Err(format!("unsupported bits allocated {bits}")),
    };
    Ok(values)
}

impl DicomDecoder {
    fn decode_pixels(data: &[u8]) -> std::result::Result<NdArray, String> {
        let module = parse(data)?;
        if module.encapsulated {
            return Err("encapsulated pixel data is not supported".to_string());
        }
        let raw = module.pixels.ok_or("no pixel data element")?;
        if module.rows == 0 || module.columns == 0 {
            return Err("missing image dimensions".to_string());
        }

        let mut values = pixels_to_f32(&module, raw)?;
        if module.photometric == "MONOCHROME1" {
            values.iter_mut().for_each(|v| *v = -*v);
        }

        let shape = if module.samples > 1 {
            vec![module.rows, module.columns, module.samples]
        } else {
            vec![module.rows, module.columns]
        };
        NdArray::new(shape, values).map_err(|e| e.to_string())
    }
}

impl Decoder for DicomDecoder {
    fn decode(&self, name: &str, data: Bytes) -> Result<Record> {
        let array = Self::decode_pixels(&data)
            .map_err(|message| DatasetError::decode(self.name(), name, message))?;
        Ok(Record::array(name, array))
    }

    fn name(&self) -> &'static str {
        "dcm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ArrayData;

    fn explicit_element(out: &mut Vec<u8>, tag: Tag, vr: &[u8; 2], value: &[u8]) {
        out.extend_from_slice(&tag.0.to_le_bytes());
        out.extend_from_slice(&tag.1.to_le_bytes());
        out.extend_from_slice(vr);
        if LONG_VRS.contains(&vr) {
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        } else {
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        }
        out.extend_from_slice(value);
    }

    fn implicit_element(out: &mut Vec<u8>, tag: Tag, value: &[u8]) {
        out.extend_from_slice(&tag.0.to_le_bytes());
        out.extend_from_slice(&tag.1.to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value);
    }

    fn file_header(syntax: &str) -> Vec<u8> {
        let mut out = vec![0u8; PREAMBLE_LEN];
        out.extend_from_slice(b"DICM");
        let mut uid = syntax.as_bytes().to_vec();
        if uid.len() % 2 == 1 {
            uid.push(0);
        }
        explicit_element(&mut out, TRANSFER_SYNTAX, b"UI", &uid);
        out
    }

    fn explicit_image(photometric: &str, pixels: &[u16]) -> Vec<u8> {
        let mut out = file_header(EXPLICIT_VR_LE);
        let mut photometric = photometric.as_bytes().to_vec();
        if photometric.len() % 2 == 1 {
            photometric.push(b' ');
        }
        explicit_element(&mut out, SAMPLES_PER_PIXEL, b"US", &1u16.to_le_bytes());
        explicit_element(&mut out, PHOTOMETRIC, b"CS", &photometric);
        explicit_element(&mut out, ROWS, b"US", &2u16.to_le_bytes());
        explicit_element(&mut out, COLUMNS, b"US", &2u16.to_le_bytes());
        explicit_element(&mut out, BITS_ALLOCATED, b"US", &16u16.to_le_bytes());
        explicit_element(&mut out, PIXEL_REPRESENTATION, b"US", &0u16.to_le_bytes());
        let raw: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        explicit_element(&mut out, PIXEL_DATA, b"OW", &raw);
        out
    }

    #[test]
    fn test_decode_explicit_vr() {
        let data = explicit_image("MONOCHROME2", &[1, 2, 3, 400]);
        let record = DicomDecoder.decode("scan", Bytes::from(data)).unwrap();
        let array = record.as_array().unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.data(), &ArrayData::F32(vec![1.0, 2.0, 3.0, 400.0]));
    }

    #[test]
    fn test_monochrome1_is_negated() {
        let data = explicit_image("MONOCHROME1", &[1, 2, 3, 4]);
        let record = DicomDecoder.decode("inv", Bytes::from(data)).unwrap();
        assert_eq!(
            record.as_array().unwrap().data(),
            &ArrayData::F32(vec![-1.0, -2.0, -3.0, -4.0])
        );
    }

    #[test]
    fn test_decode_implicit_vr_with_signed_pixels() {
        let mut out = file_header(IMPLICIT_VR_LE);
        implicit_element(&mut out, ROWS, &1u16.to_le_bytes());
        implicit_element(&mut out, COLUMNS, &3u16.to_le_bytes());
        implicit_element(&mut out, BITS_ALLOCATED, &16u16.to_le_bytes());
        implicit_element(&mut out, PIXEL_REPRESENTATION, &1u16.to_le_bytes());
        let raw: Vec<u8> = [-5i16, 0, 7].iter().flat_map(|p| p.to_le_bytes()).collect();
        implicit_element(&mut out, PIXEL_DATA, &raw);

        let record = DicomDecoder.decode("ct", Bytes::from(out)).unwrap();
        let array = record.as_array().unwrap();
        assert_eq!(array.shape(), &[1, 3]);
        assert_eq!(array.data(), &ArrayData::F32(vec![-5.0, 0.0, 7.0]));
    }

    #[test]
    fn test_skips_undefined_length_sequence() {
        let mut out = file_header(EXPLICIT_VR_LE);
        // (0008,1140) SQ of undefined length holding one undefined-length item
        out.extend_from_slice(&0x0008u16.to_le_bytes());
        out.extend_from_slice(&0x1140u16.to_le_bytes());
        out.extend_from_slice(b"SQ\0\0");
        out.extend_from_slice(&UNDEFINED_LENGTH.to_le_bytes());
        out.extend_from_slice(&ITEM_GROUP.to_le_bytes());
        out.extend_from_slice(&ITEM.1.to_le_bytes());
        out.extend_from_slice(&UNDEFINED_LENGTH.to_le_bytes());
        explicit_element(&mut out, (0x0008, 0x1150), b"UI", b"1.2\0");
        out.extend_from_slice(&ITEM_GROUP.to_le_bytes());
        out.extend_from_slice(&ITEM_END.1.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&ITEM_GROUP.to_le_bytes());
        out.extend_from_slice(&SEQUENCE_END.1.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        explicit_element(&mut out, ROWS, b"US", &1u16.to_le_bytes());
        explicit_element(&mut out, COLUMNS, b"US", &1u16.to_le_bytes());
        explicit_element(&mut out, BITS_ALLOCATED, b"US", &8u16.to_le_bytes());
        explicit_element(&mut out, PIXEL_DATA, b"OB", &[9, 0]);

        let record = DicomDecoder.decode("seq", Bytes::from(out)).unwrap();
        assert_eq!(record.as_array().unwrap().data(), &ArrayData::F32(vec![9.0]));
    }

    #[test]
    fn test_rejects_missing_preamble() {
        let result = DicomDecoder.decode("x", Bytes::from_static(b"DICM"));
        assert!(matches!(result, Err(DatasetError::Decode { .. })));
    }

    #[test]
    fn test_rejects_big_endian_syntax() {
        let mut out = file_header("1.2.840.10008.1.2.2");
        explicit_element(&mut out, ROWS, b"US", &1u16.to_le_bytes());
        let err = DicomDecoder.decode("be", Bytes::from(out)).unwrap_err();
        assert!(err.to_string().contains("transfer syntax"));
    }
}
