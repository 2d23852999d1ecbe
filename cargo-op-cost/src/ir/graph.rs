//! Core graph types shared by the reference engine and the cost calculators.

use serde::{Deserialize, Serialize};

pub type TensorId = usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor {
    pub id: TensorId,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub kind: TensorKind,
}

impl Tensor {
    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.shape.clone(), self.dtype)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    F32,
    F64,
    I32,
    I8,
    U8,
}

impl DType {
    /// Element width in bytes.
    pub const fn itemsize(self) -> usize {
        match self {
            DType::F64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::I8 | DType::U8 => 1,
        }
    }
}

/// Shape and element type of one operand, as seen by a cost calculator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorDesc {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    /// Number of elements. `None` if the count does not fit in a `u64`.
    pub fn size(&self) -> Option<u64> {
        self.shape
            .iter()
            .try_fold(1u64, |acc, &d| acc.checked_mul(u64::try_from(d).ok()?))
    }

    pub fn itemsize(&self) -> u64 {
        self.dtype.itemsize() as u64
    }

    pub fn nbytes(&self) -> Option<u64> {
        self.size()?.checked_mul(self.itemsize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorKind {
    /// Graph input - provided by caller
    Input,
    /// Graph output - returned to caller
    Output,
    /// Parameters - `len` floats starting at `offset` in `Model::data`
    Constant { offset: usize, len: usize },
    /// Intermediate activation
    Intermediate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph<Op> {
    pub tensors: Vec<Tensor>,
    pub ops: Vec<Op>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl<Op> Graph<Op> {
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    pub fn new() -> Self {
        Self {
            tensors: Vec::new(),
            ops: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_tensor(&mut self, shape: Vec<usize>, dtype: DType, kind: TensorKind) -> TensorId {
        let id = self.tensors.len();
        self.tensors.push(Tensor {
            id,
            shape,
            dtype,
            kind,
        });
        id
    }

    /// Descriptors for a list of tensor ids, in order.
    pub fn descs(&self, ids: &[TensorId]) -> Vec<TensorDesc> {
        ids.iter().map(|&id| self.tensor(id).desc()).collect()
    }
}

impl<Op> Default for Graph<Op> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_sizes() {
        let d = TensorDesc::new(vec![1, 32, 32, 3], DType::F32);
        assert_eq!(d.size(), Some(3072));
        assert_eq!(d.nbytes(), Some(3072 * 4));

        let scalar = TensorDesc::new(vec![], DType::F64);
        assert_eq!(scalar.size(), Some(1));
        assert_eq!(scalar.itemsize(), 8);
    }

    #[test]
    fn add_tensor_assigns_sequential_ids() {
        let mut g: Graph<()> = Graph::new();
        let a = g.add_tensor(vec![2], DType::F32, TensorKind::Input);
        let b = g.add_tensor(vec![2], DType::I8, TensorKind::Intermediate);
        assert_eq!((a, b), (0, 1));
        assert_eq!(g.descs(&[b, a])[0].dtype, DType::I8);
    }
}
