//! MetaImage (`.mha` / `.mhd`) reader and writer.
//!
//! A MetaImage is a text header of `Key = Value` lines terminated by
//! `ElementDataFile`, followed by raw voxel data (x fastest). With
//! `ElementDataFile = LOCAL` the data follows the header in the same file,
//! otherwise it names a detached raw file next to the header. Data may be
//! zlib compressed.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use ndarray::Array3;

use super::{ElementType, Geometry, Volume};
use crate::error::ToolboxError;

impl ElementType {
    /// Parse a MetaIO `ElementType` value.
    pub fn from_met(name: &str) -> Result<Self, ToolboxError> {
        Ok(match name {
            "MET_CHAR" => Self::I8,
            "MET_UCHAR" => Self::U8,
            "MET_SHORT" => Self::I16,
            "MET_USHORT" => Self::U16,
            "MET_INT" | "MET_LONG" => Self::I32,
            "MET_UINT" | "MET_ULONG" => Self::U32,
            "MET_LONG_LONG" => Self::I64,
            "MET_ULONG_LONG" => Self::U64,
            "MET_FLOAT" => Self::F32,
            "MET_DOUBLE" => Self::F64,
            other => return Err(ToolboxError::UnsupportedElementType(other.to_string())),
        })
    }

    pub fn met_name(&self) -> &'static str {
        match self {
            Self::I8 => "MET_CHAR",
            Self::U8 => "MET_UCHAR",
            Self::I16 => "MET_SHORT",
            Self::U16 => "MET_USHORT",
            Self::I32 => "MET_INT",
            Self::U32 => "MET_UINT",
            Self::I64 => "MET_LONG_LONG",
            Self::U64 => "MET_ULONG_LONG",
            Self::F32 => "MET_FLOAT",
            Self::F64 => "MET_DOUBLE",
        }
    }
}

/// Parsed header fields plus the offset where LOCAL data starts.
#[derive(Debug)]
struct Header {
    fields: HashMap<String, String>,
    data_offset: usize,
}

impl Header {
    fn parse(bytes: &[u8]) -> Result<Self, ToolboxError> {
        let mut fields = HashMap::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let end = bytes[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |n| pos + n);
            let line = String::from_utf8_lossy(&bytes[pos..end]);
            pos = (end + 1).min(bytes.len());

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ToolboxError::MalformedHeader(format!("expected `key = value`, got {line:?}")))?;
            let key = key.trim().to_string();
            let is_last = key == "ElementDataFile";
            fields.insert(key, value.trim().to_string());

            if is_last {
                return Ok(Self {
                    fields,
                    data_offset: pos,
                });
            }
        }

        Err(ToolboxError::MalformedHeader(
            "missing ElementDataFile".to_string(),
        ))
    }

    fn get(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.fields.get(*k))
            .map(String::as_str)
    }

    fn flag(&self, keys: &[&str]) -> bool {
        self.get(keys)
            .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
    }

    fn numbers<T: std::str::FromStr>(&self, keys: &[&str]) -> Result<Option<Vec<T>>, ToolboxError> {
        let Some(raw) = self.get(keys) else {
            return Ok(None);
        };
        raw.split_whitespace()
            .map(|s| {
                s.parse::<T>().map_err(|_| {
                    ToolboxError::MalformedHeader(format!("{} has non-numeric value {raw:?}", keys[0]))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

/// Read a MetaImage file into a [`Volume`].
pub fn read(path: &Path) -> Result<Volume> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read file: {path:?}"))?;
    let header = Header::parse(&bytes)?;

    let ndims: usize = header
        .get(&["NDims"])
        .ok_or_else(|| ToolboxError::MalformedHeader("missing NDims".into()))?
        .parse()
        .map_err(|_| ToolboxError::MalformedHeader("NDims is not a number".into()))?;
    if !(2..=3).contains(&ndims) {
        return Err(ToolboxError::MalformedHeader(format!("only 2D and 3D images are supported, got NDims = {ndims}")).into());
    }

    let dims: Vec<usize> = header
        .numbers(&["DimSize"])?
        .ok_or_else(|| ToolboxError::MalformedHeader("missing DimSize".into()))?;
    if dims.len() != ndims {
        return Err(ToolboxError::MalformedHeader(format!("DimSize has {} values for NDims = {ndims}", dims.len())).into());
    }
    let size = [dims[0], dims[1], dims.get(2).copied().unwrap_or(1)];

    if let Some(channels) = header.get(&["ElementNumberOfChannels"]) {
        if channels != "1" {
            return Err(ToolboxError::MalformedHeader(format!("{channels} channels per voxel are not supported")).into());
        }
    }

    let element_type = ElementType::from_met(
        header
            .get(&["ElementType"])
            .ok_or_else(|| ToolboxError::MalformedHeader("missing ElementType".into()))?,
    )?;
    let geometry = parse_geometry(&header, ndims)?;

    let raw = read_data(path, &bytes, &header)?;
    let voxel_count = size.iter().product::<usize>();
    let expected = voxel_count * element_type.size();
    if raw.len() < expected {
        return Err(ToolboxError::MalformedHeader(format!("expected {expected} bytes of voxel data, found {}", raw.len())).into());
    }

    let msb = header.flag(&["BinaryDataByteOrderMSB", "ElementByteOrderMSB"]);
    let values = decode(&raw[..expected], element_type, msb);
    let voxels = Array3::from_shape_vec((size[2], size[1], size[0]), values)
        .context("Voxel count does not match DimSize")?;

    Ok(Volume::new(voxels, geometry, element_type))
}

fn parse_geometry(header: &Header, ndims: usize) -> Result<Geometry, ToolboxError> {
    let mut geometry = Geometry::default();

    if let Some(spacing) = header.numbers::<f64>(&["ElementSpacing", "ElementSize"])? {
        for (dst, src) in geometry.spacing.iter_mut().zip(spacing.iter().take(ndims)) {
            *dst = *src;
        }
    }
    if let Some(origin) = header.numbers::<f64>(&["Offset", "Position", "Origin"])? {
        for (dst, src) in geometry.origin.iter_mut().zip(origin.iter().take(ndims)) {
            *dst = *src;
        }
    }
    if let Some(matrix) = header.numbers::<f64>(&["TransformMatrix", "Rotation", "Orientation"])? {
        if matrix.len() != ndims * ndims {
            return Err(ToolboxError::MalformedHeader(format!("TransformMatrix has {} values for NDims = {ndims}", matrix.len())));
        }
        for (axis, column) in matrix.chunks(ndims).enumerate() {
            for (dst, src) in geometry.axes[axis].iter_mut().zip(column.iter()) {
                *dst = *src;
            }
        }
    }
    Ok(geometry)
}

fn read_data(path: &Path, bytes: &[u8], header: &Header) -> Result<Vec<u8>> {
    let data_file = header.get(&["ElementDataFile"]).unwrap_or("LOCAL");
    let stored: Vec<u8> = if data_file.eq_ignore_ascii_case("LOCAL") {
        bytes[header.data_offset..].to_vec()
    } else if data_file.eq_ignore_ascii_case("LIST") || data_file.contains('%') {
        return Err(ToolboxError::MalformedHeader(format!("multi-file ElementDataFile {data_file:?} is not supported")).into());
    } else {
        let raw_path = path.parent().unwrap_or(Path::new(".")).join(data_file);
        fs::read(&raw_path).with_context(|| format!("Failed to read detached data: {raw_path:?}"))?
    };

    if !header.flag(&["CompressedData"]) {
        return Ok(stored);
    }

    let compressed_len = header
        .get(&["CompressedDataSize"])
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(stored.len())
        .min(stored.len());
    let mut inflated = Vec::new();
    ZlibDecoder::new(&stored[..compressed_len])
        .read_to_end(&mut inflated)
        .context("Failed to inflate compressed voxel data")?;
    Ok(inflated)
}

fn decode(bytes: &[u8], element_type: ElementType, msb: bool) -> Vec<f32> {
    macro_rules! decode_as {
        ($t:ty) => {
            bytes
                .chunks_exact(std::mem::size_of::<$t>())
                .map(|chunk| {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(chunk);
                    let value = if msb {
                        <$t>::from_be_bytes(buf)
                    } else {
                        <$t>::from_le_bytes(buf)
                    };
                    value as f32
                })
                .collect()
        };
    }

    match element_type {
        ElementType::I8 => decode_as!(i8),
        ElementType::U8 => decode_as!(u8),
        ElementType::I16 => decode_as!(i16),
        ElementType::U16 => decode_as!(u16),
        ElementType::I32 => decode_as!(i32),
        ElementType::U32 => decode_as!(u32),
        ElementType::I64 => decode_as!(i64),
        ElementType::U64 => decode_as!(u64),
        ElementType::F32 => decode_as!(f32),
        ElementType::F64 => decode_as!(f64),
    }
}

fn encode(values: impl Iterator<Item = f32>, element_type: ElementType) -> Vec<u8> {
    let mut out = Vec::new();

    macro_rules! encode_int {
        ($t:ty) => {
            for v in values {
                out.extend_from_slice(&(v.round() as $t).to_le_bytes());
            }
        };
    }
    macro_rules! encode_float {
        ($t:ty) => {
            for v in values {
                out.extend_from_slice(&(v as $t).to_le_bytes());
            }
        };
    }

    match element_type {
        ElementType::I8 => encode_int!(i8),
        ElementType::U8 => encode_int!(u8),
        ElementType::I16 => encode_int!(i16),
        ElementType::U16 => encode_int!(u16),
        ElementType::I32 => encode_int!(i32),
        ElementType::U32 => encode_int!(u32),
        ElementType::I64 => encode_int!(i64),
        ElementType::U64 => encode_int!(u64),
        ElementType::F32 => encode_float!(f32),
        ElementType::F64 => encode_float!(f64),
    }
    out
}

fn join<T: std::fmt::Display>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write `volume` as a single-file `.mha`, little endian.
pub fn write(path: &Path, volume: &Volume, compress: bool) -> Result<()> {
    // Standard layout iterates z, y, x with x fastest, matching MetaImage order.
    let raw = encode(volume.voxels.iter().copied(), volume.element_type);
    let data = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()?
    } else {
        raw
    };

    let g = &volume.geometry;
    let mut header = String::new();
    header.push_str("ObjectType = Image\nNDims = 3\nBinaryData = True\nBinaryDataByteOrderMSB = False\n");
    if compress {
        header.push_str(&format!("CompressedData = True\nCompressedDataSize = {}\n", data.len()));
    } else {
        header.push_str("CompressedData = False\n");
    }
    header.push_str(&format!("TransformMatrix = {}\n", join(g.axes.iter().flatten())));
    header.push_str(&format!("Offset = {}\n", join(g.origin)));
    header.push_str("CenterOfRotation = 0 0 0\n");
    header.push_str(&format!("ElementSpacing = {}\n", join(g.spacing)));
    header.push_str(&format!("DimSize = {}\n", join(volume.size())));
    header.push_str(&format!("ElementType = {}\n", volume.element_type.met_name()));
    header.push_str("ElementDataFile = LOCAL\n");

    let mut file = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create file: {path:?}"))?,
    );
    file.write_all(header.as_bytes())?;
    file.write_all(&data)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_volume(element_type: ElementType) -> Volume {
        let values: Vec<f32> = (0..24).map(|i| i as f32).collect();
        Volume::new(
            Array3::from_shape_vec((2, 3, 4), values).unwrap(),
            Geometry {
                spacing: [0.7, 0.7, 5.0],
                origin: [-120.5, 80.25, 12.0],
                axes: [[1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]],
            },
            element_type,
        )
    }

    fn header_with(data_lines: &str) -> Vec<u8> {
        format!(
            "ObjectType = Image\nNDims = 3\nDimSize = 2 2 1\n{data_lines}ElementDataFile = LOCAL\n"
        )
        .into_bytes()
    }

    mod header_tests {
        use super::*;

        #[test]
        fn data_offset_points_past_element_data_file_line() {
            let mut bytes = header_with("ElementType = MET_UCHAR\n");
            let header_len = bytes.len();
            bytes.extend_from_slice(&[1, 2, 3, 4]);

            let header = Header::parse(&bytes).unwrap();
            assert_eq!(header.data_offset, header_len);
            assert_eq!(header.get(&["ElementType"]), Some("MET_UCHAR"));
        }

        #[test]
        fn missing_element_data_file_is_malformed() {
            let err = Header::parse(b"NDims = 3\nDimSize = 1 1 1\n").unwrap_err();
            assert!(matches!(err, ToolboxError::MalformedHeader(_)));
        }

        #[test]
        fn crlf_lines_are_accepted() {
            let header = Header::parse(b"NDims = 3\r\nElementDataFile = LOCAL\r\n").unwrap();
            assert_eq!(header.get(&["NDims"]), Some("3"));
        }

        #[test]
        fn unknown_element_type_is_rejected() {
            assert!(matches!(
                ElementType::from_met("MET_FLOAT_MATRIX"),
                Err(ToolboxError::UnsupportedElementType(_))
            ));
        }
    }

    mod read_tests {
        use super::*;

        #[test]
        fn reads_big_endian_shorts() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("be.mha");
            let mut bytes =
                header_with("ElementType = MET_SHORT\nBinaryDataByteOrderMSB = True\n");
            for v in [1i16, -2, 300, 4] {
                bytes.extend_from_slice(&v.to_be_bytes());
            }
            fs::write(&path, bytes).unwrap();

            let volume = read(&path).unwrap();
            assert_eq!(volume.size(), [2, 2, 1]);
            assert_eq!(
                volume.voxels.iter().copied().collect::<Vec<_>>(),
                vec![1.0, -2.0, 300.0, 4.0]
            );
        }

        #[test]
        fn wide_integers_are_held_as_f32() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("int.mha");
            let mut bytes = header_with("ElementType = MET_INT\n");
            for v in [16_777_216_i32, 16_777_217, -7, 0] {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            fs::write(&path, bytes).unwrap();

            let volume = read(&path).unwrap();
            assert_eq!(volume.element_type, ElementType::I32);
            assert_eq!(
                volume.voxels.iter().copied().collect::<Vec<_>>(),
                vec![16_777_216.0, 16_777_216.0, -7.0, 0.0]
            );
        }

        #[test]
        fn two_dimensional_image_becomes_single_slice() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("2d.mha");
            let mut bytes = b"NDims = 2\nDimSize = 3 1\nElementSpacing = 0.5 0.25\nElementType = MET_UCHAR\nElementDataFile = LOCAL\n".to_vec();
            bytes.extend_from_slice(&[7, 8, 9]);
            fs::write(&path, bytes).unwrap();

            let volume = read(&path).unwrap();
            assert_eq!(volume.size(), [3, 1, 1]);
            assert_eq!(volume.geometry.spacing, [0.5, 0.25, 1.0]);
        }

        #[test]
        fn detached_raw_file_is_resolved_next_to_header() {
            let temp_dir = TempDir::new().unwrap();
            fs::write(temp_dir.path().join("img.raw"), [0u8, 1, 0, 1]).unwrap();
            let header = b"NDims = 3\nDimSize = 2 2 1\nElementType = MET_UCHAR\nElementDataFile = img.raw\n";
            fs::write(temp_dir.path().join("img.mhd"), header).unwrap();

            let volume = read(&temp_dir.path().join("img.mhd")).unwrap();
            assert_eq!(volume.sum(), 2.0);
        }

        #[test]
        fn truncated_data_is_malformed() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("short.mha");
            let mut bytes = header_with("ElementType = MET_FLOAT\n");
            bytes.extend_from_slice(&[0u8; 6]);
            fs::write(&path, bytes).unwrap();

            let err = read(&path).unwrap_err();
            assert!(err.to_string().contains("bytes of voxel data"));
        }

        #[test]
        fn multichannel_images_are_rejected() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("rgb.mha");
            let mut bytes =
                header_with("ElementNumberOfChannels = 3\nElementType = MET_UCHAR\n");
            bytes.extend_from_slice(&[0u8; 12]);
            fs::write(&path, bytes).unwrap();

            assert!(read(&path).is_err());
        }
    }

    mod write_tests {
        use super::*;

        #[test]
        fn compressed_write_reads_back_identically() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("c.mha");
            let volume = sample_volume(ElementType::I16);

            write(&path, &volume, true).unwrap();
            assert_eq!(read(&path).unwrap(), volume);
        }

        #[test]
        fn header_records_geometry_and_type() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("u.mha");
            write(&path, &sample_volume(ElementType::F32), false).unwrap();

            let bytes = fs::read(&path).unwrap();
            let header = Header::parse(&bytes).unwrap();
            assert_eq!(header.get(&["DimSize"]), Some("4 3 2"));
            assert_eq!(header.get(&["ElementType"]), Some("MET_FLOAT"));
            assert_eq!(header.get(&["Offset"]), Some("-120.5 80.25 12"));
            assert_eq!(header.get(&["TransformMatrix"]), Some("1 0 0 0 0 -1 0 1 0"));
            assert_eq!(bytes.len() - header.data_offset, 24 * 4);
        }

        #[test]
        fn integer_types_round_values() {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("r.mha");
            let mut volume = sample_volume(ElementType::U8);
            volume.voxels.fill(0.6);

            write(&path, &volume, false).unwrap();
            assert!(read(&path).unwrap().voxels.iter().all(|&v| v == 1.0));
        }
    }
}
