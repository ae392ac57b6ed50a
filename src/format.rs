//! Data formats, tile shapes and the small enums shared by queues and ops

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CompileError, CompileResult};
use crate::lexer::{single_token, Token};

/// Tile sizes must be a multiple of this many bytes
pub const TILE_ALIGNMENT_BYTES: u32 = 32;

/// Header plus trailing padding carried by every tile
const TILE_HEADER_BYTES: u32 = 32;

/// Element storage formats
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataFormat {
    Bfp2,
    Bfp2_b,
    Bfp4,
    Bfp4_b,
    Bfp8,
    Bfp8_b,
    Float16,
    Float16_b,
    Float32,
    Tf32,
    Int8,
    UInt8,
    UInt16,
    Int32,
    Lf8,
    RawUInt8,
    RawUInt16,
    RawUInt32,
}

impl DataFormat {
    pub const ALL: [DataFormat; 18] = [
        DataFormat::Bfp2,
        DataFormat::Bfp2_b,
        DataFormat::Bfp4,
        DataFormat::Bfp4_b,
        DataFormat::Bfp8,
        DataFormat::Bfp8_b,
        DataFormat::Float16,
        DataFormat::Float16_b,
        DataFormat::Float32,
        DataFormat::Tf32,
        DataFormat::Int8,
        DataFormat::UInt8,
        DataFormat::UInt16,
        DataFormat::Int32,
        DataFormat::Lf8,
        DataFormat::RawUInt8,
        DataFormat::RawUInt16,
        DataFormat::RawUInt32,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DataFormat::Bfp2 => "Bfp2",
            DataFormat::Bfp2_b => "Bfp2_b",
            DataFormat::Bfp4 => "Bfp4",
            DataFormat::Bfp4_b => "Bfp4_b",
            DataFormat::Bfp8 => "Bfp8",
            DataFormat::Bfp8_b => "Bfp8_b",
            DataFormat::Float16 => "Float16",
            DataFormat::Float16_b => "Float16_b",
            DataFormat::Float32 => "Float32",
            DataFormat::Tf32 => "Tf32",
            DataFormat::Int8 => "Int8",
            DataFormat::UInt8 => "UInt8",
            DataFormat::UInt16 => "UInt16",
            DataFormat::Int32 => "Int32",
            DataFormat::Lf8 => "Lf8",
            DataFormat::RawUInt8 => "RawUInt8",
            DataFormat::RawUInt16 => "RawUInt16",
            DataFormat::RawUInt32 => "RawUInt32",
        }
    }

    /// Formats sharing a 5-bit exponent (float16 family)
    pub fn is_exp_a(&self) -> bool {
        matches!(
            self,
            DataFormat::Float16 | DataFormat::Bfp8 | DataFormat::Bfp4 | DataFormat::Bfp2
        )
    }

    /// Formats sharing an 8-bit exponent (bfloat16 family)
    pub fn is_exp_b(&self) -> bool {
        matches!(
            self,
            DataFormat::Float16_b | DataFormat::Bfp8_b | DataFormat::Bfp4_b | DataFormat::Bfp2_b
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataFormat::Int8 | DataFormat::UInt8 | DataFormat::UInt16 | DataFormat::Int32
        )
    }

    pub fn is_raw(&self) -> bool {
        matches!(
            self,
            DataFormat::RawUInt8 | DataFormat::RawUInt16 | DataFormat::RawUInt32
        )
    }

    pub fn is_bfp2_or_bfp4(&self) -> bool {
        matches!(
            self,
            DataFormat::Bfp2 | DataFormat::Bfp2_b | DataFormat::Bfp4 | DataFormat::Bfp4_b
        )
    }

    /// Formats whose tiles carry a shared-exponent section
    fn has_exponent_section(&self) -> bool {
        matches!(
            self,
            DataFormat::Bfp2
                | DataFormat::Bfp2_b
                | DataFormat::Bfp4
                | DataFormat::Bfp4_b
                | DataFormat::Bfp8
                | DataFormat::Bfp8_b
                | DataFormat::Int8
        )
    }

    fn bits_per_element(&self) -> u32 {
        match self {
            DataFormat::Bfp2 | DataFormat::Bfp2_b => 2,
            DataFormat::Bfp4 | DataFormat::Bfp4_b => 4,
            DataFormat::Bfp8
            | DataFormat::Bfp8_b
            | DataFormat::Int8
            | DataFormat::UInt8
            | DataFormat::Lf8
            | DataFormat::RawUInt8 => 8,
            DataFormat::Float16
            | DataFormat::Float16_b
            | DataFormat::UInt16
            | DataFormat::RawUInt16 => 16,
            DataFormat::Float32 | DataFormat::Tf32 | DataFormat::Int32 | DataFormat::RawUInt32 => 32,
        }
    }
}

impl FromStr for DataFormat {
    type Err = CompileError;

    fn from_str(s: &str) -> CompileResult<Self> {
        DataFormat::ALL
            .iter()
            .copied()
            .find(|df| df.name() == s)
            .ok_or_else(|| CompileError::parse_error(format!("Invalid data format {}", s)))
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Element shape of a single tile, rows x columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TileDim {
    R32C32,
    R16C32,
    R32C16,
    R8C32,
    R4C32,
    R2C32,
    R1C32,
}

impl Default for TileDim {
    fn default() -> Self {
        TileDim::R32C32
    }
}

impl TileDim {
    pub const ALL: [TileDim; 7] = [
        TileDim::R32C32,
        TileDim::R16C32,
        TileDim::R32C16,
        TileDim::R8C32,
        TileDim::R4C32,
        TileDim::R2C32,
        TileDim::R1C32,
    ];

    pub fn from_hw(h: u32, w: u32) -> Option<Self> {
        TileDim::ALL.iter().copied().find(|t| t.height() == h && t.width() == w)
    }

    pub fn height(&self) -> u32 {
        match self {
            TileDim::R32C32 | TileDim::R32C16 => 32,
            TileDim::R16C32 => 16,
            TileDim::R8C32 => 8,
            TileDim::R4C32 => 4,
            TileDim::R2C32 => 2,
            TileDim::R1C32 => 1,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            TileDim::R32C16 => 16,
            _ => 32,
        }
    }

    pub fn elements(&self) -> u32 {
        self.height() * self.width()
    }

    /// Swap rows and columns. Shapes without a transposed counterpart are
    /// returned unchanged; callers check legality before transposing.
    pub fn transpose(&self) -> Self {
        match self {
            TileDim::R16C32 => TileDim::R32C16,
            TileDim::R32C16 => TileDim::R16C32,
            other => *other,
        }
    }

    pub fn is_tiny(&self) -> bool {
        *self != TileDim::R32C32
    }

    /// Bytes occupied by one tile of `df`, header and exponents included
    pub fn size_in_bytes(&self, df: DataFormat) -> u32 {
        let elements = self.elements();
        let data = elements * df.bits_per_element() / 8;
        let exponents = if df.has_exponent_section() {
            align_up(elements / 16, TILE_ALIGNMENT_BYTES)
        } else {
            0
        };
        TILE_HEADER_BYTES + data + exponents
    }

    pub fn is_aligned_for(&self, df: DataFormat) -> bool {
        self.size_in_bytes(df) % TILE_ALIGNMENT_BYTES == 0
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

impl FromStr for TileDim {
    type Err = CompileError;

    fn from_str(s: &str) -> CompileResult<Self> {
        match single_token(s) {
            Some(Token::TileDim((h, w))) => TileDim::from_hw(h, w),
            _ => None,
        }
        .ok_or_else(|| CompileError::parse_error(format!("Invalid tile dim {}", s)))
    }
}

impl fmt::Display for TileDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height(), self.width())
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl FromStr for $name {
            type Err = CompileError;

            fn from_str(s: &str) -> CompileResult<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(CompileError::parse_error(format!(
                        "Invalid {} {}",
                        stringify!($name),
                        s
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => write!(f, $text),)+
                }
            }
        }
    };
}

string_enum!(
    /// Math precision of the FPU
    MathFidelity {
        LoFi => "LoFi",
        HiFi2 => "HiFi2",
        HiFi3 => "HiFi3",
        HiFi4 => "HiFi4",
    }
);

string_enum!(
    /// Which faces of a tile an SFPU op processes
    VectorMode {
        R => "r",
        C => "c",
        Rc => "rc",
    }
);

string_enum!(ReluMode { Min => "min", Max => "max" });

string_enum!(StochRndMode {
    None => "none",
    Fpu => "fpu",
    Pack => "pack",
    All => "all",
});

string_enum!(UblockOrder { R => "r", C => "c" });

string_enum!(SfpuExecutionThread {
    Math => "math",
    Pack => "pack",
});

impl Default for UblockOrder {
    fn default() -> Self {
        UblockOrder::R
    }
}

impl Default for StochRndMode {
    fn default() -> Self {
        StochRndMode::None
    }
}

impl Default for SfpuExecutionThread {
    fn default() -> Self {
        SfpuExecutionThread::Math
    }
}

impl UblockOrder {
    /// Parse the upper- or lower-case spelling used by netlists
    pub fn parse(s: &str) -> CompileResult<Self> {
        s.to_ascii_lowercase().parse()
    }
}

/// Block shape of a queue or op output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    pub t: u32,
    pub ublock_rt: u32,
    pub ublock_ct: u32,
    pub mblock_m: u32,
    pub mblock_n: u32,
    pub ublock_order: UblockOrder,
}

impl Default for Dim {
    fn default() -> Self {
        Self {
            t: 1,
            ublock_rt: 1,
            ublock_ct: 1,
            mblock_m: 1,
            mblock_n: 1,
            ublock_order: UblockOrder::R,
        }
    }
}

impl Dim {
    pub fn is_valid(&self) -> bool {
        self.t > 0 && self.ublock_rt > 0 && self.ublock_ct > 0 && self.mblock_m > 0 && self.mblock_n > 0
    }

    pub fn ublock_tiles(&self) -> u32 {
        self.ublock_rt * self.ublock_ct
    }

    /// Tiles held by one core for a single `t` slice
    pub fn mblock_tiles(&self) -> u64 {
        u64::from(self.ublock_tiles()) * u64::from(self.mblock_m) * u64::from(self.mblock_n)
    }
}

/// Core grid shape, rows x columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GridShape {
    pub r: u32,
    pub c: u32,
}

impl GridShape {
    pub fn new(r: u32, c: u32) -> Self {
        Self { r, c }
    }

    pub fn cores(&self) -> u32 {
        self.r * self.c
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.r, self.c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_formats() {
        assert_eq!("Bfp8_b".parse::<DataFormat>().unwrap(), DataFormat::Bfp8_b);
        assert_eq!("RawUInt32".parse::<DataFormat>().unwrap(), DataFormat::RawUInt32);
        assert!("Bfp16".parse::<DataFormat>().is_err());
    }

    #[test]
    fn test_tile_dim_parse_and_transpose() {
        let dim: TileDim = "16x32".parse().unwrap();
        assert_eq!(dim, TileDim::R16C32);
        assert_eq!(dim.transpose(), TileDim::R32C16);
        assert_eq!(dim.transpose().transpose(), dim);
        assert!("32x8".parse::<TileDim>().is_err());
        assert_eq!(TileDim::default().to_string(), "32x32");
    }

    #[test]
    fn test_full_tile_sizes() {
        assert_eq!(TileDim::R32C32.size_in_bytes(DataFormat::Float16_b), 2080);
        assert_eq!(TileDim::R32C32.size_in_bytes(DataFormat::Bfp8_b), 1120);
        assert_eq!(TileDim::R32C32.size_in_bytes(DataFormat::Float32), 4128);
    }

    #[test]
    fn test_tiny_block_float_tiles_misalign() {
        assert!(!TileDim::R1C32.is_aligned_for(DataFormat::Bfp2_b));
        assert!(!TileDim::R2C32.is_aligned_for(DataFormat::Bfp2));
        assert!(!TileDim::R1C32.is_aligned_for(DataFormat::Bfp4_b));
        assert!(TileDim::R2C32.is_aligned_for(DataFormat::Bfp4));
        assert!(TileDim::R1C32.is_aligned_for(DataFormat::Bfp8_b));
        assert!(TileDim::R4C32.is_aligned_for(DataFormat::Bfp2_b));
    }

    #[test]
    fn test_every_non_block_float_pair_is_aligned() {
        for df in DataFormat::ALL.iter().filter(|df| !df.is_bfp2_or_bfp4()) {
            for tile in TileDim::ALL {
                assert!(tile.is_aligned_for(*df), "{} {}", df, tile);
            }
        }
    }

    #[test]
    fn test_small_enums() {
        assert_eq!("rc".parse::<VectorMode>().unwrap(), VectorMode::Rc);
        assert_eq!(UblockOrder::parse("C").unwrap(), UblockOrder::C);
        assert!("HiFi5".parse::<MathFidelity>().is_err());
        assert_eq!(StochRndMode::Pack.to_string(), "pack");
    }
}
