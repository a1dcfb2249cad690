// rust/ptfu-core/src/datatype.rs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{
    Cifar10Decoder, Decoder, DicomDecoder, ImageDecoder, NpyDecoder, PickleDecoder, RawDecoder,
};
use crate::record::has_extension;

/// Kind of member stored in an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Png,
    Jpg,
    Dicom,
    Npy,
    Pkl,
    Cifar10,
    Other,
}

static PNG: ImageDecoder = ImageDecoder::PNG;
static JPG: ImageDecoder = ImageDecoder::JPEG;
static DICOM: DicomDecoder = DicomDecoder;
static NPY: NpyDecoder = NpyDecoder;
static PKL: PickleDecoder = PickleDecoder;
static CIFAR10: Cifar10Decoder = Cifar10Decoder;
static RAW: RawDecoder = RawDecoder;

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::Png,
        DataType::Jpg,
        DataType::Dicom,
        DataType::Npy,
        DataType::Pkl,
        DataType::Cifar10,
        DataType::Other,
    ];

    /// Member file extension, without the dot. Empty for [`DataType::Other`].
    pub fn extension(self) -> &'static str {
        match self {
            DataType::Png => "png",
            DataType::Jpg => "jpg",
            DataType::Dicom => "dcm",
            DataType::Npy => "npy",
            DataType::Pkl => "pkl",
            DataType::Cifar10 => "cifar10",
            DataType::Other => "",
        }
    }

    /// The decoder bound to this type.
    pub fn decoder(self) -> &'static dyn Decoder {
        match self {
            DataType::Png => &PNG,
            DataType::Jpg => &JPG,
            DataType::Dicom => &DICOM,
            DataType::Npy => &NPY,
            DataType::Pkl => &PKL,
            DataType::Cifar10 => &CIFAR10,
            DataType::Other => &RAW,
        }
    }

    /// Whether a member name carries this type's extension (case-insensitive).
    ///
    /// An empty extension matches every member.
    pub fn matches(self, member: &str) -> bool {
        has_extension(member, self.extension())
    }

    /// Candidate member names for a requested record name: the name itself,
    /// then `name.<ext>`.
    pub fn candidates(self, name: &str) -> Vec<String> {
        let mut names = vec![name.to_string()];
        let ext = self.extension();
        if !ext.is_empty() && !self.matches(name) {
            names.push(format!("{name}.{ext}"));
        }
        names
    }

    /// Looks a type up by extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<DataType> {
        let ext = ext.trim_start_matches('.');
        if ext.eq_ignore_ascii_case("jpeg") {
            return Some(DataType::Jpg);
        }
        Self::ALL
            .into_iter()
            .find(|dt| !dt.extension().is_empty() && dt.extension().eq_ignore_ascii_case(ext))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Other => write!(f, "other"),
            dt => write!(f, "{}", dt.extension()),
        }
    }
}
