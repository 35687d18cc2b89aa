use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::types::{RowId, Value};

/// Physical representation requested for a column base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    Plain,
    Dictionary,
    FrameOfReference,
}

/// Dictionary size limits for coded columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryTiers {
    /// Entries addressable with 8-bit codes.
    pub small: usize,
    /// Entries addressable before the column is decompressed.
    pub large: usize,
}

impl From<&StoreConfig> for DictionaryTiers {
    fn from(config: &StoreConfig) -> Self {
        DictionaryTiers {
            small: config.dictionary_small_limit,
            large: config.dictionary_large_limit,
        }
    }
}

impl Default for DictionaryTiers {
    fn default() -> Self {
        DictionaryTiers::from(&StoreConfig::default())
    }
}

/// Append-only value dictionary; codes never change once assigned.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    values: Vec<Value>,
    index: HashMap<Value, u32>,
}

impl Dictionary {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn code_of(&self, value: &Value) -> Option<u32> {
        self.index.get(value).copied()
    }

    fn decode(&self, code: u32) -> Value {
        self.values.get(code as usize).cloned().unwrap_or(Value::Null)
    }

    fn intern(&mut self, value: &Value) -> Result<u32> {
        if let Some(code) = self.index.get(value) {
            return Ok(*code);
        }
        let code = u32::try_from(self.values.len()).map_err(|_| Error::internal("dictionary overflow"))?;
        self.values.try_reserve(1)?;
        self.values.push(value.clone());
        self.index.insert(value.clone(), code);
        Ok(code)
    }

    /// Entries the dictionary would hold after interning `values`.
    fn size_with(&self, values: &[Value]) -> usize {
        let mut fresh: Vec<&Value> = values.iter().filter(|v| !self.index.contains_key(*v)).collect();
        fresh.sort();
        fresh.dedup();
        self.values.len() + fresh.len()
    }
}

/// What writing a batch of values into a base requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    Fits,
    /// 8-bit dictionary codes must widen to 16 bits.
    Widen,
    /// The base must become plain storage.
    Decompress,
}

/// One column base array.
#[derive(Debug, Clone)]
pub enum StorageArray {
    Plain(Vec<Value>),
    Dict8 { dict: Dictionary, codes: Vec<u8> },
    Dict16 { dict: Dictionary, codes: Vec<u16> },
    FrameOfReference { reference: i64, codes: Vec<u16> },
}

impl Default for StorageArray {
    fn default() -> Self {
        StorageArray::Plain(Vec::new())
    }
}

impl StorageArray {
    /// Encode `values` as `kind`.
    pub fn build(kind: StorageKind, values: Vec<Value>, tiers: DictionaryTiers) -> Result<Self> {
        match kind {
            StorageKind::Plain => Ok(StorageArray::Plain(values)),
            StorageKind::Dictionary => {
                let mut dict = Dictionary::default();
                let size = dict.size_with(&values);
                if size > tiers.large {
                    return Err(Error::InvalidOperation(format!(
                        "{} distinct values exceed the dictionary limit {}",
                        size, tiers.large
                    )));
                }
                if size <= tiers.small {
                    let codes = encode_with(&mut dict, &values, |c| u8::try_from(c).ok())?;
                    Ok(StorageArray::Dict8 { dict, codes })
                } else {
                    let codes = encode_with(&mut dict, &values, |c| u16::try_from(c).ok())?;
                    Ok(StorageArray::Dict16 { dict, codes })
                }
            }
            StorageKind::FrameOfReference => {
                let mut ints = Vec::new();
                ints.try_reserve(values.len())?;
                for v in &values {
                    let n = v.as_int().ok_or_else(|| {
                        Error::InvalidOperation(format!("frame of reference needs integers, got {:?}", v))
                    })?;
                    ints.push(n);
                }
                let reference = ints.iter().copied().min().unwrap_or(0);
                let codes = ints
                    .iter()
                    .map(|&n| for_code(reference, n))
                    .collect::<Option<Vec<u16>>>()
                    .ok_or_else(|| Error::InvalidOperation("value range too wide for frame of reference".into()))?;
                Ok(StorageArray::FrameOfReference { reference, codes })
            }
        }
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            StorageArray::Plain(_) => StorageKind::Plain,
            StorageArray::Dict8 { .. } | StorageArray::Dict16 { .. } => StorageKind::Dictionary,
            StorageArray::FrameOfReference { .. } => StorageKind::FrameOfReference,
        }
    }

    pub fn len(&self) -> u64 {
        (match self {
            StorageArray::Plain(v) => v.len(),
            StorageArray::Dict8 { codes, .. } => codes.len(),
            StorageArray::Dict16 { codes, .. } => codes.len(),
            StorageArray::FrameOfReference { codes, .. } => codes.len(),
        }) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same representation, no rows. Dictionaries start over.
    pub fn empty_like(&self) -> Self {
        match self {
            StorageArray::Plain(_) => StorageArray::Plain(Vec::new()),
            StorageArray::Dict8 { .. } | StorageArray::Dict16 { .. } => StorageArray::Dict8 {
                dict: Dictionary::default(),
                codes: Vec::new(),
            },
            StorageArray::FrameOfReference { reference, .. } => StorageArray::FrameOfReference {
                reference: *reference,
                codes: Vec::new(),
            },
        }
    }

    pub fn get(&self, rid: RowId) -> Option<Value> {
        let i = usize::try_from(rid).ok()?;
        match self {
            StorageArray::Plain(v) => v.get(i).cloned(),
            StorageArray::Dict8 { dict, codes } => codes.get(i).map(|&c| dict.decode(c as u32)),
            StorageArray::Dict16 { dict, codes } => codes.get(i).map(|&c| dict.decode(c as u32)),
            StorageArray::FrameOfReference { reference, codes } => {
                codes.get(i).map(|&c| Value::Int(reference + c as i64))
            }
        }
    }

    /// Decoded rows `[start, end)`, clipped to the array.
    pub fn decode_range(&self, start: RowId, end: RowId) -> Vec<Value> {
        let end = end.min(self.len());
        (start..end).filter_map(|rid| self.get(rid)).collect()
    }

    pub fn decode_all(&self) -> Vec<Value> {
        self.decode_range(0, self.len())
    }

    pub fn dictionary(&self) -> Option<&Dictionary> {
        match self {
            StorageArray::Dict8 { dict, .. } | StorageArray::Dict16 { dict, .. } => Some(dict),
            _ => None,
        }
    }

    /// Decide whether `values` can be written without changing representation.
    pub fn fit(&self, values: &[Value], tiers: DictionaryTiers) -> Fit {
        match self {
            StorageArray::Plain(_) => Fit::Fits,
            StorageArray::Dict8 { dict, .. } => {
                let size = dict.size_with(values);
                if size <= tiers.small.min(u8::MAX as usize + 1) {
                    Fit::Fits
                } else if size <= tiers.large {
                    Fit::Widen
                } else {
                    Fit::Decompress
                }
            }
            StorageArray::Dict16 { dict, .. } => {
                if dict.size_with(values) <= tiers.large {
                    Fit::Fits
                } else {
                    Fit::Decompress
                }
            }
            StorageArray::FrameOfReference { reference, .. } => {
                let fits = values
                    .iter()
                    .all(|v| v.as_int().is_some_and(|n| for_code(*reference, n).is_some()));
                if fits { Fit::Fits } else { Fit::Decompress }
            }
        }
    }

    /// A copy in the representation `fit` asks for.
    pub fn reencode(&self, fit: Fit) -> Result<Self> {
        match (fit, self) {
            (Fit::Fits, _) => Ok(self.clone()),
            (Fit::Widen, StorageArray::Dict8 { dict, codes }) => {
                let mut wide = Vec::new();
                wide.try_reserve(codes.len())?;
                wide.extend(codes.iter().map(|&c| c as u16));
                Ok(StorageArray::Dict16 {
                    dict: dict.clone(),
                    codes: wide,
                })
            }
            (Fit::Widen, _) => Err(Error::internal(format!("cannot widen {:?} storage", self.kind()))),
            (Fit::Decompress, _) => Ok(StorageArray::Plain(self.decode_all())),
        }
    }

    /// Write `values` at `offset`, overwriting rows below the current length,
    /// extending past it and padding any gap.
    pub fn write_at(&mut self, offset: RowId, values: &[Value]) -> Result<()> {
        match self {
            StorageArray::Plain(v) => place(v, offset, values.to_vec(), Value::Null),
            StorageArray::Dict8 { dict, codes } => {
                let encoded = encode_with(dict, values, |c| u8::try_from(c).ok())?;
                place(codes, offset, encoded, 0)
            }
            StorageArray::Dict16 { dict, codes } => {
                let encoded = encode_with(dict, values, |c| u16::try_from(c).ok())?;
                place(codes, offset, encoded, 0)
            }
            StorageArray::FrameOfReference { reference, codes } => {
                let reference = *reference;
                let encoded = values
                    .iter()
                    .map(|v| v.as_int().and_then(|n| for_code(reference, n)))
                    .collect::<Option<Vec<u16>>>()
                    .ok_or_else(|| Error::internal("value outside the frame of reference"))?;
                place(codes, offset, encoded, 0)
            }
        }
    }

    /// Give every value in `values` a dictionary code ahead of a later write.
    pub fn intern_all(&mut self, values: &[Value]) -> Result<()> {
        if let StorageArray::Dict8 { dict, .. } | StorageArray::Dict16 { dict, .. } = self {
            for v in values {
                dict.intern(v)?;
            }
        }
        Ok(())
    }

    /// Overwrite individual rows; ids must be below the current length.
    pub fn apply(&mut self, ids: &[RowId], values: &[Value]) -> Result<()> {
        for (rid, value) in ids.iter().zip(values) {
            if *rid >= self.len() {
                return Err(Error::internal(format!("update of row {} past base end {}", rid, self.len())));
            }
            self.write_at(*rid, std::slice::from_ref(value))?;
        }
        Ok(())
    }

    /// Smallest and largest non-null value stored, including rows since deleted.
    ///
    /// Dictionary arrays only consider entries some row still references.
    pub fn min_max(&self) -> Option<(Value, Value)> {
        let mut it: Box<dyn Iterator<Item = Value> + '_> = match self {
            StorageArray::Plain(v) => Box::new(v.iter().cloned()),
            StorageArray::Dict8 { dict, codes } => referenced(dict, codes.iter().map(|&c| usize::from(c))),
            StorageArray::Dict16 { dict, codes } => referenced(dict, codes.iter().map(|&c| usize::from(c))),
            StorageArray::FrameOfReference { .. } => return None,
        };
        let first = it.by_ref().find(|v| !v.is_null())?;
        Some(it.filter(|v| !v.is_null()).fold((first.clone(), first), |(lo, hi), v| {
            let lo = if v < lo { v.clone() } else { lo };
            let hi = if v > hi { v } else { hi };
            (lo, hi)
        }))
    }

    /// Ascending order check; only known for plain storage.
    pub fn is_sorted(&self) -> Option<bool> {
        match self {
            StorageArray::Plain(v) => Some(v.windows(2).all(|w| w[0] <= w[1])),
            _ => None,
        }
    }
}

fn referenced<'a>(dict: &'a Dictionary, codes: impl Iterator<Item = usize>) -> Box<dyn Iterator<Item = Value> + 'a> {
    let mut seen = vec![false; dict.values().len()];
    for code in codes {
        if let Some(s) = seen.get_mut(code) {
            *s = true;
        }
    }
    Box::new(
        dict.values()
            .iter()
            .zip(seen)
            .filter_map(|(v, used)| used.then(|| v.clone())),
    )
}

fn for_code(reference: i64, n: i64) -> Option<u16> {
    n.checked_sub(reference).and_then(|d| u16::try_from(d).ok())
}

fn encode_with<T>(dict: &mut Dictionary, values: &[Value], narrow: impl Fn(u32) -> Option<T>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve(values.len())?;
    for v in values {
        let code = dict.intern(v)?;
        out.push(narrow(code).ok_or_else(|| Error::internal(format!("dictionary code {} too wide", code)))?);
    }
    Ok(out)
}

fn place<T: Clone>(dst: &mut Vec<T>, offset: RowId, values: Vec<T>, pad: T) -> Result<()> {
    let offset = usize::try_from(offset).map_err(|_| Error::internal("offset overflow"))?;
    let end = offset + values.len();
    if end > dst.len() {
        dst.try_reserve(end - dst.len())?;
    }
    if offset > dst.len() {
        dst.resize(offset, pad);
    }
    let overlap = dst.len().saturating_sub(offset).min(values.len());
    let mut values = values.into_iter();
    for (slot, v) in dst[offset..offset + overlap].iter_mut().zip(values.by_ref()) {
        *slot = v;
    }
    dst.extend(values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(Value::Int).collect()
    }

    #[test]
    fn test_write_at_overwrites_extends_and_pads() {
        let mut arr = StorageArray::Plain(ints(0..3));
        arr.write_at(2, &ints(10..12)).unwrap();
        assert_eq!(arr.decode_all(), vec![Value::Int(0), Value::Int(1), Value::Int(10), Value::Int(11)]);
        arr.write_at(6, &[Value::Int(7)]).unwrap();
        assert_eq!(arr.len(), 7);
        assert_eq!(arr.get(4), Some(Value::Null));
        assert_eq!(arr.get(6), Some(Value::Int(7)));
    }

    #[test]
    fn test_dictionary_build_and_decode() {
        let values: Vec<Value> = ["a", "b", "a", "c"].into_iter().map(Value::from).collect();
        let arr = StorageArray::build(StorageKind::Dictionary, values.clone(), DictionaryTiers::default()).unwrap();
        assert!(matches!(arr, StorageArray::Dict8 { .. }));
        assert_eq!(arr.dictionary().unwrap().len(), 3);
        assert_eq!(arr.decode_all(), values);
    }

    #[test]
    fn test_dictionary_tiers() {
        let tiers = DictionaryTiers { small: 4, large: 8 };
        let arr = StorageArray::build(StorageKind::Dictionary, ints(0..4), tiers).unwrap();
        assert_eq!(arr.fit(&ints(0..4), tiers), Fit::Fits);
        assert_eq!(arr.fit(&ints(3..6), tiers), Fit::Widen);
        assert_eq!(arr.fit(&ints(0..9), tiers), Fit::Decompress);

        let mut wide = arr.reencode(Fit::Widen).unwrap();
        assert!(matches!(wide, StorageArray::Dict16 { .. }));
        wide.write_at(4, &ints(4..6)).unwrap();
        assert_eq!(wide.decode_all(), ints(0..6));

        let plain = wide.reencode(Fit::Decompress).unwrap();
        assert_eq!(plain.kind(), StorageKind::Plain);
        assert_eq!(plain.decode_all(), ints(0..6));
    }

    #[test]
    fn test_frame_of_reference() {
        let tiers = DictionaryTiers::default();
        let arr = StorageArray::build(StorageKind::FrameOfReference, ints(1000..1010), tiers).unwrap();
        assert_eq!(arr.get(3), Some(Value::Int(1003)));
        assert_eq!(arr.fit(&[Value::Int(1500)], tiers), Fit::Fits);
        assert_eq!(arr.fit(&[Value::Int(5)], tiers), Fit::Decompress);
        assert_eq!(arr.fit(&[Value::from("x")], tiers), Fit::Decompress);
        assert!(arr.min_max().is_none());

        let err = StorageArray::build(StorageKind::FrameOfReference, vec![Value::from("x")], tiers).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_min_max_and_sorted() {
        let arr = StorageArray::Plain(vec![Value::Int(3), Value::Null, Value::Int(-2), Value::Int(9)]);
        assert_eq!(arr.min_max(), Some((Value::Int(-2), Value::Int(9))));
        assert_eq!(arr.is_sorted(), Some(false));
        assert_eq!(StorageArray::Plain(ints(0..5)).is_sorted(), Some(true));
    }

    #[test]
    fn test_min_max_of_dictionary_skips_overwritten_entries() {
        let tiers = DictionaryTiers::default();
        let values = vec![Value::Int(1), Value::Int(5), Value::Int(9)];
        let mut arr = StorageArray::build(StorageKind::Dictionary, values, tiers).unwrap();
        assert_eq!(arr.min_max(), Some((Value::Int(1), Value::Int(9))));
        arr.write_at(2, &[Value::Int(3)]).unwrap();
        assert_eq!(arr.decode_all(), vec![Value::Int(1), Value::Int(5), Value::Int(3)]);
        assert_eq!(arr.min_max(), Some((Value::Int(1), Value::Int(5))));
    }

    #[test]
    fn test_empty_like_keeps_kind() {
        let arr = StorageArray::build(StorageKind::FrameOfReference, ints(5..8), DictionaryTiers::default()).unwrap();
        let empty = arr.empty_like();
        assert_eq!(empty.kind(), StorageKind::FrameOfReference);
        assert!(empty.is_empty());
    }
}
