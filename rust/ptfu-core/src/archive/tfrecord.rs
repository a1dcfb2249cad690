// rust/ptfu-core/src/archive/tfrecord.rs

//! TFRecord files holding one `tf.train.Example` per record.
//!
//! Each frame is `u64 length | masked crc32c(length) | data | masked
//! crc32c(data)`, little-endian. The example carries three features: `name`
//! and `data` as byte lists and an optional `label` as an int64 list. Files
//! are written gzip-compressed; each writer session appends a new gzip member,
//! and the reader accepts both compressed and plain files.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;

use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::location::Location;
use super::{not_found, ArchiveSource, ArchiveWriter, Member, MemberVisitor, SourceHandle};
use crate::config::StorageConfig;
use crate::error::{DatasetError, Result};
use crate::record::Record;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MASK_DELTA: u32 = 0xa282_ead8;

const NAME_FEATURE: &str = "name";
const DATA_FEATURE: &str = "data";
const LABEL_FEATURE: &str = "label";

fn masked_crc(data: &[u8]) -> u32 {
    let crc = CRC32C.checksum(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// One decoded example.
#[derive(Debug, Clone, PartialEq)]
struct Example {
    name: String,
    data: Bytes,
    label: Option<i64>,
}

// Protobuf wire helpers. Only the subset needed by `tf.train.Example`.

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn put_len_field(buf: &mut Vec<u8>, field: u64, data: &[u8]) {
    put_varint(buf, (field << 3) | WIRE_LEN);
    put_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Option<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    // (field number, wire type)
    fn key(&mut self) -> Option<(u64, u64)> {
        let key = self.varint()?;
        Some((key >> 3, key & 0x7))
    }

    fn len_delimited(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.varint()?).ok()?;
        self.bytes(len)
    }

    fn skip(&mut self, wire: u64) -> Option<()> {
        match wire {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_FIXED64 => self.bytes(8).map(|_| ()),
            WIRE_LEN => self.len_delimited().map(|_| ()),
            WIRE_FIXED32 => self.bytes(4).map(|_| ()),
            _ => None,
        }
    }
}

enum Feature<'a> {
    Bytes(&'a [u8]),
    Int64(i64),
    Other,
}

impl Example {
    fn encode(&self) -> Vec<u8> {
        let mut features = Vec::new();

        let mut entry = |key: &str, feature: Vec<u8>| {
            let mut item = Vec::new();
            put_len_field(&mut item, 1, key.as_bytes());
            put_len_field(&mut item, 2, &feature);
            put_len_field(&mut features, 1, &item);
        };

        let bytes_feature = |value: &[u8]| {
            let mut list = Vec::new();
            put_len_field(&mut list, 1, value);
            let mut feature = Vec::new();
            put_len_field(&mut feature, 1, &list);
            feature
        };

        entry(NAME_FEATURE, bytes_feature(self.name.as_bytes()));
        entry(DATA_FEATURE, bytes_feature(&self.data));
        if let Some(label) = self.label {
            let mut packed = Vec::new();
            put_varint(&mut packed, label as u64);
            let mut list = Vec::new();
            put_len_field(&mut list, 1, &packed);
            let mut feature = Vec::new();
            put_len_field(&mut feature, 3, &list);
            entry(LABEL_FEATURE, feature);
        }

        let mut example = Vec::new();
        put_len_field(&mut example, 1, &features);
        example
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let mut name = None;
        let mut payload = None;
        let mut label = None;

        let mut example = WireReader::new(data);
        while !example.is_done() {
            let (field, wire) = example.key()?;
            if field != 1 || wire != WIRE_LEN {
                example.skip(wire)?;
                continue;
            }
            let mut features = WireReader::new(example.len_delimited()?);
            while !features.is_done() {
                let (field, wire) = features.key()?;
                if field != 1 || wire != WIRE_LEN {
                    features.skip(wire)?;
                    continue;
                }
                let (key, feature) = Self::map_entry(features.len_delimited()?)?;
                match (key, feature) {
                    (NAME_FEATURE, Feature::Bytes(b)) => {
                        name = Some(String::from_utf8_lossy(b).into_owned())
                    }
                    (DATA_FEATURE, Feature::Bytes(b)) => payload = Some(Bytes::copy_from_slice(b)),
                    (LABEL_FEATURE, Feature::Int64(v)) => label = Some(v),
                    _ => {}
                }
            }
        }

        Some(Self {
            name: name?,
            data: payload.unwrap_or_default(),
            label,
        })
    }

    fn map_entry(data: &[u8]) -> Option<(&str, Feature<'_>)> {
        let mut key = "";
        let mut feature = Feature::Other;
        let mut entry = WireReader::new(data);
        while !entry.is_done() {
            match entry.key()? {
                (1, WIRE_LEN) => key = std::str::from_utf8(entry.len_delimited()?).ok()?,
                (2, WIRE_LEN) => feature = Self::feature(entry.len_delimited()?)?,
                (_, wire) => entry.skip(wire)?,
            }
        }
        Some((key, feature))
    }

    // First value of a bytes_list (1) or int64_list (3).
    fn feature(data: &[u8]) -> Option<Feature<'_>> {
        let mut feature = WireReader::new(data);
        let mut out = Feature::Other;
        while !feature.is_done() {
            match feature.key()? {
                (1, WIRE_LEN) => {
                    let mut list = WireReader::new(feature.len_delimited()?);
                    while !list.is_done() {
                        match list.key()? {
                            (1, WIRE_LEN) => {
                                out = Feature::Bytes(list.len_delimited()?);
                                break;
                            }
                            (_, wire) => list.skip(wire)?,
                        }
                    }
                }
                (3, WIRE_LEN) => {
                    let mut list = WireReader::new(feature.len_delimited()?);
                    while !list.is_done() {
                        match list.key()? {
                            (1, WIRE_LEN) => {
                                let mut packed = WireReader::new(list.len_delimited()?);
                                if !packed.is_done() {
                                    out = Feature::Int64(packed.varint()? as i64);
                                    break;
                                }
                            }
                            (1, WIRE_VARINT) => {
                                out = Feature::Int64(list.varint()? as i64);
                                break;
                            }
                            (_, wire) => list.skip(wire)?,
                        }
                    }
                }
                (_, wire) => feature.skip(wire)?,
            }
        }
        Some(out)
    }
}

fn frame(data: &[u8]) -> Vec<u8> {
    let len = (data.len() as u64).to_le_bytes();
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(&len);
    out.extend_from_slice(&masked_crc(&len).to_le_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(&masked_crc(data).to_le_bytes());
    out
}

/// Splits a TFRecord stream into frame payloads, verifying both checksums.
fn unframe(mut stream: &[u8]) -> std::result::Result<Vec<&[u8]>, String> {
    let mut frames = Vec::new();
    while !stream.is_empty() {
        if stream.len() < 12 {
            return Err(format!("truncated frame header at record {}", frames.len()));
        }
        let (len_bytes, rest) = stream.split_at(8);
        let (len_crc, rest) = rest.split_at(4);
        if u32::from_le_bytes([len_crc[0], len_crc[1], len_crc[2], len_crc[3]]) != masked_crc(len_bytes)
        {
            return Err(format!("length checksum mismatch at record {}", frames.len()));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(len_bytes);
        let len = usize::try_from(u64::from_le_bytes(len))
            .map_err(|_| format!("oversized record {}", frames.len()))?;
        if rest.len() < len.saturating_add(4) {
            return Err(format!("truncated record {}", frames.len()));
        }
        let (data, rest) = rest.split_at(len);
        let (data_crc, rest) = rest.split_at(4);
        if u32::from_le_bytes([data_crc[0], data_crc[1], data_crc[2], data_crc[3]]) != masked_crc(data) {
            return Err(format!("data checksum mismatch at record {}", frames.len()));
        }
        frames.push(data);
        stream = rest;
    }
    Ok(frames)
}

#[derive(Debug, Clone)]
pub struct TfRecordSource {
    location: Location,
    storage: StorageConfig,
}

impl TfRecordSource {
    pub fn new(location: Location, storage: StorageConfig) -> Self {
        Self { location, storage }
    }

    fn examples(&self) -> Result<Vec<Example>> {
        let raw = self.location.read_all(&self.storage)?;
        let plain = if raw.starts_with(&[0x1f, 0x8b]) {
            let mut out = Vec::new();
            MultiGzDecoder::new(&raw[..])
                .read_to_end(&mut out)
                .map_err(|e| self.location.io_error("failed to inflate tfrecord", e))?;
            Bytes::from(out)
        } else {
            raw
        };

        let frames = unframe(&plain)
            .map_err(|message| DatasetError::archive(self.location.to_string(), message))?;
        frames
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                Example::decode(data).ok_or_else(|| {
                    DatasetError::archive(
                        self.location.to_string(),
                        format!("record {i} is not a named example"),
                    )
                })
            })
            .collect()
    }
}

struct TfRecordHandle {
    members: HashMap<String, (Bytes, Option<i64>)>,
    location: String,
}

impl SourceHandle for TfRecordHandle {
    fn raw_member(&mut self, member: &str) -> Result<Member> {
        let (data, label) = self
            .members
            .get(member)
            .cloned()
            .ok_or_else(|| not_found(member, &self.location))?;
        Ok(Member::Raw { data, label })
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

impl ArchiveSource for TfRecordSource {
    fn open(&self) -> Result<Box<dyn SourceHandle>> {
        let members = self
            .examples()?
            .into_iter()
            .map(|e| (e.name, (e.data, e.label)))
            .collect();
        Ok(Box::new(TfRecordHandle {
            members,
            location: self.location.to_string(),
        }))
    }

    fn member_names(&self) -> Result<Vec<String>> {
        Ok(self.examples()?.into_iter().map(|e| e.name).collect())
    }

    fn for_each_member(&self, visitor: &mut MemberVisitor<'_>) -> Result<()> {
        for example in self.examples()? {
            if !visitor(&example.name, example.data)? {
                break;
            }
        }
        Ok(())
    }

    fn cache_key(&self) -> String {
        format!("tfrecord:{}", self.location)
    }

    fn location(&self) -> String {
        self.location.to_string()
    }
}

/// Appends records to a gzip-compressed TFRecord file.
pub struct TfRecordWriter {
    path: PathBuf,
    buffer_size: usize,
    encoder: Option<GzEncoder<BufWriter<File>>>,
}

impl TfRecordWriter {
    pub fn new(path: impl Into<PathBuf>, storage: &StorageConfig) -> Self {
        Self {
            path: path.into(),
            buffer_size: storage.buffer_size,
            encoder: None,
        }
    }

    fn io_error(&self, message: impl Into<String>, e: std::io::Error) -> DatasetError {
        DatasetError::storage_with_source(&self.path, message, e)
    }
}

impl ArchiveWriter for TfRecordWriter {
    fn open_dst(&mut self) -> Result<()> {
        if self.encoder.is_some() {
            return Err(DatasetError::archive(self.destination(), "destination already open"));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DatasetError::storage_with_source(parent, "failed to create parent directories", e)
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error("failed to open tfrecord", e))?;
        self.encoder = Some(GzEncoder::new(
            BufWriter::with_capacity(self.buffer_size, file),
            Compression::default(),
        ));
        Ok(())
    }

    fn close_dst(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };
        let mut writer = encoder
            .finish()
            .map_err(|e| self.io_error("failed to finish tfrecord", e))?;
        writer
            .flush()
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(|e| self.io_error("failed to sync tfrecord", e))
    }

    fn write_record(&mut self, name: &str, record: &Record) -> Result<()> {
        let example = Example {
            name: record.persisted_name(name),
            data: record.persisted_bytes()?,
            label: record.label,
        };
        let framed = frame(&example.encode());
        let destination = self.destination();
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| DatasetError::archive(destination, "destination is not open"))?;
        encoder
            .write_all(&framed)
            .map_err(|e| DatasetError::storage_with_source(&self.path, "failed to write record", e))
    }

    fn destination(&self) -> String {
        self.path.display().to_string()
    }
}
