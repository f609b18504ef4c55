//! Named tensor snapshots of a model and their checkpoint format.
use crate::{ErrorKind, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::crc32::checksum_castagnoli;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use trackable::error::ErrorKindExt;

const MAGIC: &[u8; 4] = b"SNCK";
const FORMAT_VERSION: u8 = 1;

/// A flattened tensor and its original shape.
#[derive(Debug, Clone)]
pub struct StateTensor<B: Backend> {
    pub dims: Vec<usize>,
    pub values: Tensor<B, 1>,
}

/// Named tensors of a model (weights and batch-norm statistics).
#[derive(Debug, Clone)]
pub struct StateDict<B: Backend> {
    tensors: BTreeMap<String, StateTensor<B>>,
}
impl<B: Backend> StateDict<B> {
    pub fn new() -> Self {
        Self {
            tensors: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|k| k.as_str())
    }

    pub fn insert<const D: usize>(&mut self, name: String, tensor: Tensor<B, D>) {
        let dims = tensor.dims().to_vec();
        let n = dims.iter().product::<usize>();
        let values = tensor.reshape([n]);
        self.tensors.insert(name, StateTensor { dims, values });
    }

    pub fn get<const D: usize>(&self, name: &str) -> Result<Tensor<B, D>> {
        let entry = track_assert_some!(
            self.tensors.get(name),
            ErrorKind::InvalidInput,
            "missing tensor {:?}",
            name
        );
        let shape: [usize; D] = track_assert_some!(
            entry.dims.clone().try_into().ok(),
            ErrorKind::InvalidInput,
            "tensor {:?} has {} dimensions (expected {})",
            name,
            entry.dims.len(),
            D
        );
        Ok(entry.values.clone().reshape(shape))
    }

    /// Copies every tensor onto `device`.
    pub fn to_device(&self, device: &B::Device) -> Self {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, v)| {
                let moved = StateTensor {
                    dims: v.dims.clone(),
                    values: v.values.clone().to_device(device),
                };
                (k.clone(), moved)
            })
            .collect();
        Self { tensors }
    }

    /// Writes the checkpoint: a header, then one checksummed entry per tensor.
    pub fn to_writer<W: Write>(&self, mut writer: W) -> Result<()> {
        track_any_err!(writer.write_all(MAGIC))?;
        track_any_err!(writer.write_u8(FORMAT_VERSION))?;
        track_any_err!(writer.write_u32::<BigEndian>(self.tensors.len() as u32))?;
        for (name, entry) in &self.tensors {
            let mut payload = Vec::new();
            track!(write_tensor(&mut payload, name, entry))?;
            track_any_err!(writer.write_u32::<BigEndian>(payload.len() as u32))?;
            track_any_err!(writer.write_all(&payload))?;
            track_any_err!(writer.write_u32::<BigEndian>(checksum_castagnoli(&payload)))?;
        }
        Ok(())
    }

    pub fn from_reader<R: Read>(mut reader: R, device: &B::Device) -> Result<Self> {
        let mut magic = [0; 4];
        track_any_err!(reader.read_exact(&mut magic))?;
        track_assert_eq!(&magic, MAGIC, ErrorKind::InvalidInput, "not a checkpoint");
        let version = track_any_err!(reader.read_u8())?;
        track_assert_eq!(version, FORMAT_VERSION, ErrorKind::InvalidInput);

        let count = track_any_err!(reader.read_u32::<BigEndian>())?;
        let mut tensors = BTreeMap::new();
        for _ in 0..count {
            let len = track_any_err!(reader.read_u32::<BigEndian>())?;
            let mut payload = vec![0; len as usize];
            track_any_err!(reader.read_exact(&mut payload))?;
            let crc = track_any_err!(reader.read_u32::<BigEndian>())?;
            track_assert_eq!(
                crc,
                checksum_castagnoli(&payload),
                ErrorKind::Other,
                "corrupted checkpoint entry"
            );
            let (name, entry) = track!(read_tensor(&payload[..], device))?;
            tensors.insert(name, entry);
        }
        Ok(Self { tensors })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = track_any_err!(File::create(&path); path.as_ref())?;
        let mut writer = BufWriter::new(file);
        track!(self.to_writer(&mut writer))?;
        track_any_err!(writer.flush())?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &B::Device) -> Result<Self> {
        let file = track_any_err!(File::open(&path); path.as_ref())?;
        track!(Self::from_reader(BufReader::new(file), device))
    }
}
impl<B: Backend> Default for StateDict<B> {
    fn default() -> Self {
        Self::new()
    }
}

fn write_tensor<B: Backend, W: Write>(
    mut writer: W,
    name: &str,
    entry: &StateTensor<B>,
) -> Result<()> {
    track_any_err!(writer.write_u16::<BigEndian>(name.len() as u16))?;
    track_any_err!(writer.write_all(name.as_bytes()))?;

    track_any_err!(writer.write_u8(entry.dims.len() as u8))?;
    for &d in &entry.dims {
        track_any_err!(writer.write_u32::<BigEndian>(d as u32))?;
    }

    let values = entry
        .values
        .clone()
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| ErrorKind::Other.cause(format!("{:?}", e)))?;
    for v in values {
        track_any_err!(writer.write_f32::<BigEndian>(v))?;
    }
    Ok(())
}

fn read_tensor<B: Backend, R: Read>(
    mut reader: R,
    device: &B::Device,
) -> Result<(String, StateTensor<B>)> {
    let name_len = track_any_err!(reader.read_u16::<BigEndian>())?;
    let mut name = vec![0; name_len as usize];
    track_any_err!(reader.read_exact(&mut name))?;
    let name = track_any_err!(String::from_utf8(name))?;

    let ndims = track_any_err!(reader.read_u8())?;
    let mut dims = Vec::with_capacity(ndims as usize);
    for _ in 0..ndims {
        dims.push(track_any_err!(reader.read_u32::<BigEndian>())? as usize);
    }

    let n = dims.iter().product::<usize>();
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(track_any_err!(reader.read_f32::<BigEndian>())?);
    }
    let values = Tensor::from_data(TensorData::new(values, [n]), device);
    Ok((name, StateTensor { dims, values }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use trackable::result::TopLevelResult;

    #[test]
    fn checkpoint_works() -> TopLevelResult {
        let device = Default::default();
        let mut state = StateDict::<NdArray>::new();
        let weight = Tensor::<NdArray, 1>::from_floats([1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &device)
            .reshape([2, 3]);
        state.insert("fc.weight".to_owned(), weight);
        state.insert(
            "fc.bias".to_owned(),
            Tensor::<NdArray, 1>::from_floats([0.5, -0.5], &device),
        );

        let mut buf = Vec::new();
        track!(state.to_writer(&mut buf))?;
        let restored = track!(StateDict::<NdArray>::from_reader(&buf[..], &device))?;
        assert_eq!(restored.keys().collect::<Vec<_>>(), ["fc.bias", "fc.weight"]);

        let weight = track!(restored.get::<2>("fc.weight"))?;
        assert_eq!(weight.dims(), [2, 3]);
        let values = weight.into_data().to_vec::<f32>().expect("f32 data");
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert!(restored.get::<1>("fc.weight").is_err());
        assert!(restored.get::<1>("fc.unknown").is_err());
        Ok(())
    }

    #[test]
    fn damaged_checkpoints_are_rejected() -> TopLevelResult {
        let device = Default::default();
        let mut state = StateDict::<NdArray>::new();
        state.insert(
            "fc.bias".to_owned(),
            Tensor::<NdArray, 1>::from_floats([0.5, -0.5], &device),
        );
        let mut buf = Vec::new();
        track!(state.to_writer(&mut buf))?;

        let mut flipped = buf.clone();
        let last_value = flipped.len() - 5;
        flipped[last_value] ^= 0xff;
        assert!(StateDict::<NdArray>::from_reader(&flipped[..], &device).is_err());

        let mut foreign = buf.clone();
        foreign[0] = b'X';
        assert!(StateDict::<NdArray>::from_reader(&foreign[..], &device).is_err());

        let truncated = &buf[..buf.len() - 1];
        assert!(StateDict::<NdArray>::from_reader(truncated, &device).is_err());
        Ok(())
    }
}
