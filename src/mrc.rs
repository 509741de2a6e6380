//! Minimal MRC2014 volume reader/writer.
//!
//! Reads modes 0 (int8), 1 (int16), 2 (float32) and 6 (uint16) in either
//! byte order and always writes little-endian float32 (mode 2), which is
//! what the filtering binary consumes.

use crate::error::ConversionError;
use std::path::Path;

/// Size of the fixed MRC header in bytes.
pub const HEADER_LEN: usize = 1024;

const LABEL_LEN: usize = 80;

/// Voxel storage mode from header word 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Int8,
    Int16,
    Float32,
    UInt16,
}

impl Mode {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Mode::Int8),
            1 => Some(Mode::Int16),
            2 => Some(Mode::Float32),
            6 => Some(Mode::UInt16),
            _ => None,
        }
    }

    fn code(self) -> i32 {
        match self {
            Mode::Int8 => 0,
            Mode::Int16 => 1,
            Mode::Float32 => 2,
            Mode::UInt16 => 6,
        }
    }

    fn bytes_per_voxel(self) -> usize {
        match self {
            Mode::Int8 => 1,
            Mode::Int16 | Mode::UInt16 => 2,
            Mode::Float32 => 4,
        }
    }
}

/// The fields of an MRC header this crate cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct MrcHeader {
    /// Columns, rows, sections.
    pub dims: (usize, usize, usize),
    pub mode: Mode,
    /// Pixel size in Å along x, y, z.
    pub voxel_size: [f32; 3],
    pub origin: [f32; 3],
    /// Bytes of extended header following the main header.
    pub extended_len: usize,
    /// Bytes of voxel data following the extended header.
    data_len: usize,
    big_endian: bool,
}

impl MrcHeader {
    /// Reads and validates only the header of the file at `path`.
    pub fn read(path: &Path) -> Result<Self, ConversionError> {
        use std::io::Read;

        let mut file = std::fs::File::open(path).map_err(|source| ConversionError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .map_err(|source| ConversionError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&buf, path)
    }

    /// Cubic edge length, if the volume is a cube.
    pub fn cubic_dimension(&self) -> Option<usize> {
        let (x, y, z) = self.dims;
        (x == y && y == z).then_some(x)
    }

    /// Size in bytes of a complete file with this header.
    pub fn file_len(&self) -> usize {
        HEADER_LEN + self.extended_len + self.data_len
    }

    /// Reads the header and checks that the file holds all the voxel data
    /// it announces.
    pub fn read_complete(path: &Path) -> Result<Self, ConversionError> {
        let header = Self::read(path)?;
        let actual = std::fs::metadata(path)
            .map_err(|source| ConversionError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if actual < header.file_len() as u64 {
            return Err(ConversionError::InvalidHeader {
                path: path.to_path_buf(),
                reason: format!(
                    "expected at least {} bytes, file has {actual}",
                    header.file_len()
                ),
            });
        }
        Ok(header)
    }

    fn parse(buf: &[u8; HEADER_LEN], path: &Path) -> Result<Self, ConversionError> {
        let invalid = |reason: String| ConversionError::InvalidHeader {
            path: path.to_path_buf(),
            reason,
        };

        // MACHST: 0x44 0x44/0x41 for little endian, 0x11 0x11 for big endian.
        // Files from old writers leave it zeroed; those are little endian.
        let big_endian = buf[212] == 0x11;
        let word = Word { buf, big_endian };

        let (nx, ny, nz) = (word.i32(0), word.i32(1), word.i32(2));
        if nx <= 0 || ny <= 0 || nz <= 0 {
            return Err(invalid(format!("non-positive dimensions {nx}x{ny}x{nz}")));
        }
        let mode_code = word.i32(3);
        let mode = Mode::from_code(mode_code)
            .ok_or_else(|| invalid(format!("unsupported mode {mode_code}")))?;

        let sampling = [word.i32(7), word.i32(8), word.i32(9)];
        let cell = [word.f32(10), word.f32(11), word.f32(12)];
        let mut voxel_size = [1.0f32; 3];
        for axis in 0..3 {
            if sampling[axis] > 0 && cell[axis] > 0.0 {
                voxel_size[axis] = cell[axis] / sampling[axis] as f32;
            }
        }

        let extended = word.i32(23);
        if extended < 0 {
            return Err(invalid(format!("negative extended header size {extended}")));
        }

        let dims = (nx as usize, ny as usize, nz as usize);
        let data_len = dims
            .0
            .checked_mul(dims.1)
            .and_then(|n| n.checked_mul(dims.2))
            .and_then(|n| n.checked_mul(mode.bytes_per_voxel()))
            .filter(|n| n.checked_add(HEADER_LEN + extended as usize).is_some())
            .ok_or_else(|| invalid(format!("dimensions {nx}x{ny}x{nz} are too large")))?;

        Ok(Self {
            dims,
            mode,
            voxel_size,
            origin: [word.f32(49), word.f32(50), word.f32(51)],
            extended_len: extended as usize,
            data_len,
            big_endian,
        })
    }
}

struct Word<'a> {
    buf: &'a [u8; HEADER_LEN],
    big_endian: bool,
}

impl Word<'_> {
    fn raw(&self, index: usize) -> [u8; 4] {
        let at = index * 4;
        [
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ]
    }

    fn i32(&self, index: usize) -> i32 {
        if self.big_endian {
            i32::from_be_bytes(self.raw(index))
        } else {
            i32::from_le_bytes(self.raw(index))
        }
    }

    fn f32(&self, index: usize) -> f32 {
        if self.big_endian {
            f32::from_be_bytes(self.raw(index))
        } else {
            f32::from_le_bytes(self.raw(index))
        }
    }
}

/// A 3D density map held in memory as float32, x varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    dims: (usize, usize, usize),
    voxel_size: [f32; 3],
    origin: [f32; 3],
    data: Vec<f32>,
}

impl Volume {
    /// Builds a volume from raw voxels.
    ///
    /// Returns `None` when `data` does not hold exactly `nx * ny * nz` values.
    pub fn new(dims: (usize, usize, usize), voxel_size: f32, data: Vec<f32>) -> Option<Self> {
        let count = dims.0.checked_mul(dims.1)?.checked_mul(dims.2)?;
        (data.len() == count && !data.is_empty()).then(|| Self {
            dims,
            voxel_size: [voxel_size; 3],
            origin: [0.0; 3],
            data,
        })
    }

    /// A cube of edge `dim` filled with `value`.
    pub fn filled(dim: usize, voxel_size: f32, value: f32) -> Self {
        Self {
            dims: (dim, dim, dim),
            voxel_size: [voxel_size; 3],
            origin: [0.0; 3],
            data: vec![value; dim * dim * dim],
        }
    }

    /// Reads the volume stored at `path`.
    pub fn read(path: &Path) -> Result<Self, ConversionError> {
        let bytes = std::fs::read(path).map_err(|source| ConversionError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.len() < HEADER_LEN {
            return Err(ConversionError::InvalidHeader {
                path: path.to_path_buf(),
                reason: format!("file is only {} bytes long", bytes.len()),
            });
        }
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = MrcHeader::parse(&head, path)?;

        let start = HEADER_LEN + header.extended_len;
        let needed = header.data_len;
        let body = bytes
            .get(start..header.file_len())
            .ok_or_else(|| ConversionError::InvalidHeader {
                path: path.to_path_buf(),
                reason: format!(
                    "expected {needed} bytes of voxel data, file has {}",
                    bytes.len().saturating_sub(start)
                ),
            })?;

        Ok(Self {
            dims: header.dims,
            voxel_size: header.voxel_size,
            origin: header.origin,
            data: decode_voxels(body, header.mode, header.big_endian),
        })
    }

    /// Writes the volume as little-endian float32 MRC2014.
    pub fn write(&self, path: &Path) -> Result<(), ConversionError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        out.extend_from_slice(&self.header_bytes());
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(path, out).map_err(|source| ConversionError::Unwritable {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    /// Cubic edge length, if the volume is a cube.
    pub fn cubic_dimension(&self) -> Option<usize> {
        let (x, y, z) = self.dims;
        (x == y && y == z).then_some(x)
    }

    /// Pixel size in Å along x.
    pub fn voxel_size(&self) -> f32 {
        self.voxel_size[0]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Value at integer coordinates.
    pub fn at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[x + self.dims.0 * (y + self.dims.1 * z)]
    }

    fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut put = |index: usize, bytes: [u8; 4]| {
            buf[index * 4..index * 4 + 4].copy_from_slice(&bytes);
        };

        let (nx, ny, nz) = self.dims;
        let (min, max, mean, rms) = statistics(&self.data);

        put(0, (nx as i32).to_le_bytes());
        put(1, (ny as i32).to_le_bytes());
        put(2, (nz as i32).to_le_bytes());
        put(3, Mode::Float32.code().to_le_bytes());
        put(7, (nx as i32).to_le_bytes());
        put(8, (ny as i32).to_le_bytes());
        put(9, (nz as i32).to_le_bytes());
        put(10, (nx as f32 * self.voxel_size[0]).to_le_bytes());
        put(11, (ny as f32 * self.voxel_size[1]).to_le_bytes());
        put(12, (nz as f32 * self.voxel_size[2]).to_le_bytes());
        for index in 13..16 {
            put(index, 90.0f32.to_le_bytes());
        }
        put(16, 1i32.to_le_bytes());
        put(17, 2i32.to_le_bytes());
        put(18, 3i32.to_le_bytes());
        put(19, min.to_le_bytes());
        put(20, max.to_le_bytes());
        put(21, mean.to_le_bytes());
        put(22, 1i32.to_le_bytes());
        put(27, 20140i32.to_le_bytes());
        put(49, self.origin[0].to_le_bytes());
        put(50, self.origin[1].to_le_bytes());
        put(51, self.origin[2].to_le_bytes());
        put(52, *b"MAP ");
        put(53, [0x44, 0x44, 0x00, 0x00]);
        put(54, rms.to_le_bytes());
        put(55, 1i32.to_le_bytes());

        let label = format!("halfmap-filter {}", env!("CARGO_PKG_VERSION"));
        let label = label.as_bytes();
        let len = label.len().min(LABEL_LEN);
        buf[224..224 + len].copy_from_slice(&label[..len]);
        buf
    }
}

fn decode_voxels(body: &[u8], mode: Mode, big_endian: bool) -> Vec<f32> {
    macro_rules! decode {
        ($ty:ty, $n:expr) => {
            body.chunks_exact($n)
                .map(|c| {
                    let mut raw = [0u8; $n];
                    raw.copy_from_slice(c);
                    let v = if big_endian {
                        <$ty>::from_be_bytes(raw)
                    } else {
                        <$ty>::from_le_bytes(raw)
                    };
                    v as f32
                })
                .collect()
        };
    }

    match mode {
        Mode::Int8 => body.iter().map(|b| *b as i8 as f32).collect(),
        Mode::Int16 => decode!(i16, 2),
        Mode::UInt16 => decode!(u16, 2),
        Mode::Float32 => decode!(f32, 4),
    }
}

/// min, max, mean and rms deviation from the mean.
fn statistics(data: &[f32]) -> (f32, f32, f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f64;
    for &v in data {
        min = min.min(v);
        max = max.max(v);
        sum += v as f64;
    }
    let mean = sum / data.len() as f64;
    let var = data
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / data.len() as f64;
    (min, max, mean as f32, var.sqrt() as f32)
}
