use rustc_hash::FxHashMap;

use crate::desc::TensorDesc;

/// Constant tensor data stored in an operator attribute.
///
/// Values are stored as `f32` regardless of the descriptor's data type, in
/// storage order, with one element per entry of the storage shape.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstTensor {
    desc: TensorDesc,
    data: Vec<f32>,
}

impl ConstTensor {
    /// Create a constant with every storage element set to `value`.
    ///
    /// Returns `None` if the descriptor has unknown dimensions.
    pub fn full(desc: TensorDesc, value: f32) -> Option<ConstTensor> {
        let len = desc.storage_len()?;
        Some(ConstTensor {
            desc,
            data: vec![value; len],
        })
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Value of an operator attribute.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    IntLists(Vec<Vec<i64>>),
    Tensor(ConstTensor),
}

impl From<i64> for AttrValue {
    fn from(val: i64) -> Self {
        AttrValue::Int(val)
    }
}

impl From<f32> for AttrValue {
    fn from(val: f32) -> Self {
        AttrValue::Float(val)
    }
}

impl From<bool> for AttrValue {
    fn from(val: bool) -> Self {
        AttrValue::Bool(val)
    }
}

impl From<&str> for AttrValue {
    fn from(val: &str) -> Self {
        AttrValue::Str(val.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(val: String) -> Self {
        AttrValue::Str(val)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(val: Vec<i64>) -> Self {
        AttrValue::Ints(val)
    }
}

impl From<Vec<Vec<i64>>> for AttrValue {
    fn from(val: Vec<Vec<i64>>) -> Self {
        AttrValue::IntLists(val)
    }
}

impl From<ConstTensor> for AttrValue {
    fn from(val: ConstTensor) -> Self {
        AttrValue::Tensor(val)
    }
}

/// Typed key-value store of operator attributes.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Attrs {
    values: FxHashMap<String, AttrValue>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute, replacing any previous value.
    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            AttrValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_ints(&self, name: &str) -> Option<&[i64]> {
        match self.get(name)? {
            AttrValue::Ints(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_int_lists(&self, name: &str) -> Option<&[Vec<i64>]> {
        match self.get(name)? {
            AttrValue::IntLists(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_tensor(&self, name: &str) -> Option<&ConstTensor> {
        match self.get(name)? {
            AttrValue::Tensor(v) => Some(v),
            _ => None,
        }
    }
}
