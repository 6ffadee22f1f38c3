//! Weight sources: where full, unsharded checkpoint tensors come from.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};

use super::error::ShardingError;

/// A name-addressable store of full tensors.
///
/// Loading is destructive: `pop` removes the tensor, so once every layer has
/// taken its shard the source holds nothing the ranks still need.
pub trait WeightSource: Send {
    /// Remove and return the tensor named `name`.
    fn pop(&mut self, name: &str) -> Result<Tensor, ShardingError>;

    fn contains(&self, name: &str) -> bool;

    /// Remove `name` and check its shape.
    fn pop_with_shape(&mut self, name: &str, shape: &[usize]) -> Result<Tensor, ShardingError> {
        let t = self.pop(name)?;
        if t.dims() != shape {
            return Err(ShardingError::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: t.dims().to_vec(),
            });
        }
        Ok(t)
    }
}

/// `HashMap`-backed weight source.
#[derive(Debug, Default, Clone)]
pub struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every tensor from a set of safetensors files onto `device`.
    pub fn from_safetensors<P: AsRef<Path>>(paths: &[P], device: &Device) -> candle_core::Result<Self> {
        let mut tensors = HashMap::new();
        for path in paths {
            tensors.extend(candle_core::safetensors::load(path, device)?);
        }
        Ok(Self { tensors })
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Remaining tensor names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl From<HashMap<String, Tensor>> for TensorMap {
    fn from(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }
}

impl WeightSource for TensorMap {
    fn pop(&mut self, name: &str) -> Result<Tensor, ShardingError> {
        self.tensors
            .remove(name)
            .ok_or_else(|| ShardingError::MissingWeight(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_pop_removes_entry() {
        let mut map = TensorMap::new();
        map.insert("a", Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        map.insert("b", Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
        assert_eq!(map.names(), vec!["a", "b"]);

        let a = map.pop("a").unwrap();
        assert_eq!(a.dims(), &[2]);
        assert_eq!(map.len(), 1);
        assert!(matches!(map.pop("a"), Err(ShardingError::MissingWeight(n)) if n == "a"));
    }

    #[test]
    fn test_safetensors_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("dbrx-tp-ws-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert(
            "transformer.norm_f.weight".to_string(),
            Tensor::ones(4, DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let mut map = TensorMap::from_safetensors(&[&path], &Device::Cpu).unwrap();
        let w = map.pop_with_shape("transformer.norm_f.weight", &[4]).unwrap();
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![1.0; 4]);
        assert!(map.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }
}
