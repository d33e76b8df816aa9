//! Tensor descriptors: logical shape, tiled storage shape, element type and
//! memory format.

use std::error::Error;
use std::fmt;

use smallvec::SmallVec;

/// Edge length of the square sub-blocks used by fractal storage formats.
pub const TILE_SIZE: usize = 16;

/// Round `size` up to the next multiple of [`TILE_SIZE`].
pub fn align_to_tile(size: usize) -> usize {
    size.div_ceil(TILE_SIZE) * TILE_SIZE
}

/// Return true if `size` is a multiple of [`TILE_SIZE`].
pub fn is_tile_aligned(size: usize) -> bool {
    size % TILE_SIZE == 0
}

/// Size of one dimension of a tensor's logical shape.
#[derive(Copy, Clone, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dimension {
    /// A dimension whose size is known when the graph is built.
    Fixed(usize),

    /// A dimension whose size is only known at runtime.
    Unknown,
}

impl Dimension {
    /// Return the size of this dimension, if known.
    pub fn fixed(self) -> Option<usize> {
        match self {
            Dimension::Fixed(size) => Some(size),
            Dimension::Unknown => None,
        }
    }
}

impl From<usize> for Dimension {
    fn from(size: usize) -> Dimension {
        Dimension::Fixed(size)
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Unknown => write!(f, "?"),
        }
    }
}

/// Logical shape of a tensor.
pub type Shape = SmallVec<[Dimension; 5]>;

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    Float16,
    Float32,
    Int32,
}

impl DataType {
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float16 | DataType::Float32)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float16 => "float16",
            DataType::Float32 => "float32",
            DataType::Int32 => "int32",
        };
        write!(f, "{}", name)
    }
}

/// Memory layout of a tensor.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Format {
    /// Plain row-major layout.
    Nd,

    /// The last two dimensions `[m, n]` are stored as column blocks of
    /// `TILE_SIZE x TILE_SIZE` tiles: `[.., ceil(n/16), ceil(m/16), 16, 16]`.
    FractalNz,

    /// Matrix `[k, n]` stored as row blocks of tiles:
    /// `[ceil(k/16), ceil(n/16), 16, 16]`. Used for matmul weights.
    FractalZ,
}

impl Format {
    /// Return the name of the format as used in operator attributes.
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Nd => "ND",
            Format::FractalNz => "FRACTAL_NZ",
            Format::FractalZ => "FRACTAL_Z",
        }
    }

    pub fn is_fractal(self) -> bool {
        !matches!(self, Format::Nd)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors when constructing a [`TensorDesc`].
#[derive(Clone, Debug, PartialEq)]
pub enum DescError {
    /// The format cannot represent a tensor with this many dimensions.
    UnsupportedRank { format: Format, ndim: usize },

    /// A fixed shape was required but some dimensions are unknown.
    UnknownDims,

    /// An axis is out of range for a tensor of rank `ndim`.
    AxisOutOfRange { axis: usize, ndim: usize },

    /// A per-axis argument has `len` entries for a tensor of rank `ndim`.
    RankMismatch { len: usize, ndim: usize },

    /// A slice ends at `end` along an axis of size `size`.
    SliceOutOfRange { axis: usize, end: usize, size: usize },
}

impl fmt::Display for DescError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedRank { format, ndim } => {
                write!(f, "format {} does not support rank {}", format, ndim)
            }
            Self::UnknownDims => write!(f, "shape has unknown dimensions"),
            Self::AxisOutOfRange { axis, ndim } => {
                write!(f, "axis {} is out of range for rank {}", axis, ndim)
            }
            Self::RankMismatch { len, ndim } => {
                write!(f, "expected {} per-axis values but got {}", ndim, len)
            }
            Self::SliceOutOfRange { axis, end, size } => write!(
                f,
                "slice end {} exceeds size {} of axis {}",
                end, size, axis
            ),
        }
    }
}

impl Error for DescError {}

/// Describes one tensor flowing along a graph edge.
///
/// The storage shape is always derived from the logical shape, format and
/// [`TILE_SIZE`], so the two cannot disagree. Descriptors are immutable:
/// changing any property means building a new descriptor.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TensorDesc {
    shape: Shape,

    /// Tiled shape in memory. `None` if any logical dimension is unknown.
    storage_shape: Option<SmallVec<[usize; 6]>>,

    dtype: DataType,
    format: Format,

    /// Format the tensor had in the source model, before any layout
    /// transforms were applied.
    origin_format: Format,
}

impl TensorDesc {
    /// Create a descriptor from a logical shape that may contain unknown
    /// dimensions.
    pub fn new(shape: &[Dimension], dtype: DataType, format: Format) -> Result<Self, DescError> {
        let storage_shape = storage_shape(shape, format)?;
        Ok(TensorDesc {
            shape: shape.into(),
            storage_shape,
            dtype,
            format,
            origin_format: format,
        })
    }

    /// Create a descriptor for a tensor whose dimensions are all known.
    pub fn fixed(shape: &[usize], dtype: DataType, format: Format) -> Result<Self, DescError> {
        let dims: Shape = shape.iter().copied().map(Dimension::Fixed).collect();
        Self::new(&dims, dtype, format)
    }

    /// Create a row-major descriptor for a tensor whose dimensions are all
    /// known. This cannot fail.
    pub fn nd(shape: &[usize], dtype: DataType) -> Self {
        let dims: Shape = shape.iter().copied().map(Dimension::Fixed).collect();
        TensorDesc {
            storage_shape: Some(shape.into()),
            shape: dims,
            dtype,
            format: Format::Nd,
            origin_format: Format::Nd,
        }
    }

    /// Return a copy of this descriptor with a different origin format.
    pub fn with_origin_format(mut self, origin_format: Format) -> Self {
        self.origin_format = origin_format;
        self
    }

    pub fn shape(&self) -> &[Dimension] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return the size of dimension `index`, or `None` if it is unknown or
    /// out of range.
    pub fn dim(&self, index: usize) -> Option<usize> {
        self.shape.get(index).and_then(|d| d.fixed())
    }

    /// Return the logical shape if every dimension is known.
    pub fn fixed_shape(&self) -> Option<SmallVec<[usize; 5]>> {
        self.shape.iter().map(|d| d.fixed()).collect()
    }

    /// Return true if every dimension of the logical shape is known.
    pub fn is_static(&self) -> bool {
        self.storage_shape.is_some()
    }

    /// Return the tiled shape of this tensor in memory.
    pub fn storage_shape(&self) -> Option<&[usize]> {
        self.storage_shape.as_deref()
    }

    /// Return the number of elements in storage, including tile padding.
    pub fn storage_len(&self) -> Option<usize> {
        self.storage_shape().map(|s| s.iter().product())
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn origin_format(&self) -> Format {
        self.origin_format
    }
}

/// Compute the storage shape of a tensor with a given logical shape and
/// format.
fn storage_shape(
    shape: &[Dimension],
    format: Format,
) -> Result<Option<SmallVec<[usize; 6]>>, DescError> {
    let ndim = shape.len();
    let rank_ok = match format {
        Format::Nd => true,
        Format::FractalNz => ndim >= 2,
        Format::FractalZ => ndim == 2,
    };
    if !rank_ok {
        return Err(DescError::UnsupportedRank { format, ndim });
    }

    let Some(dims) = shape
        .iter()
        .map(|d| d.fixed())
        .collect::<Option<SmallVec<[usize; 6]>>>()
    else {
        return Ok(None);
    };

    let blocks = |size: usize| size.div_ceil(TILE_SIZE);
    let storage = match format {
        Format::Nd => dims,
        Format::FractalNz => {
            let (batch, matrix) = dims.split_at(ndim - 2);
            let (m, n) = (matrix[0], matrix[1]);
            let mut storage: SmallVec<[usize; 6]> = batch.into();
            storage.extend([blocks(n), blocks(m), TILE_SIZE, TILE_SIZE]);
            storage
        }
        Format::FractalZ => {
            let (k, n) = (dims[0], dims[1]);
            [blocks(k), blocks(n), TILE_SIZE, TILE_SIZE].into_iter().collect()
        }
    };
    Ok(Some(storage))
}
