//! Serialization traits for Tensile binary records.

use crate::{BinaryWriter, IoResult, MemoryReader};

/// Objects that encode to and decode from the Tensile binary format.
pub trait Serializable {
    /// Serializes into the writer.
    fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()>;

    /// Deserializes from the reader.
    fn deserialize(reader: &mut MemoryReader<'_>) -> IoResult<Self>
    where
        Self: Sized;
}

/// Extension methods for serializable objects.
pub trait SerializableExt: Serializable {
    /// Encodes to a byte vector.
    fn to_bytes(&self) -> IoResult<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        self.serialize(&mut writer)?;
        Ok(writer.into_bytes())
    }

    /// Decodes from a byte slice.
    fn from_bytes(data: &[u8]) -> IoResult<Self>
    where
        Self: Sized,
    {
        let mut reader = MemoryReader::new(data);
        Self::deserialize(&mut reader)
    }
}

impl<T: Serializable> SerializableExt for T {}

/// Array helpers with count caps.
pub mod helper {
    use super::Serializable;
    use crate::{BinaryWriter, IoResult, MemoryReader};

    /// Serializes a slice with a var-int count prefix.
    pub fn serialize_array<T: Serializable>(
        items: &[T],
        writer: &mut BinaryWriter,
    ) -> IoResult<()> {
        writer.write_var_u64(items.len() as u64)?;
        for item in items {
            item.serialize(writer)?;
        }
        Ok(())
    }

    /// Deserializes a counted array, rejecting counts above `max`.
    pub fn deserialize_array<T: Serializable>(
        reader: &mut MemoryReader<'_>,
        what: &str,
        max: usize,
    ) -> IoResult<Vec<T>> {
        let count = reader.read_var_u64_capped(what, max as u64)? as usize;
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            items.push(T::deserialize(reader)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::helper;
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        a: u32,
        b: String,
    }

    impl Serializable for Pair {
        fn serialize(&self, writer: &mut BinaryWriter) -> IoResult<()> {
            writer.write_u32(self.a)?;
            writer.write_string(&self.b)
        }

        fn deserialize(reader: &mut MemoryReader<'_>) -> IoResult<Self> {
            Ok(Self {
                a: reader.read_u32()?,
                b: reader.read_string()?,
            })
        }
    }

    #[test]
    fn test_roundtrip() {
        let pair = Pair {
            a: 9,
            b: "x".into(),
        };
        let bytes = pair.to_bytes().unwrap();
        assert_eq!(Pair::from_bytes(&bytes).unwrap(), pair);
    }

    #[test]
    fn test_array_cap() {
        let items = vec![
            Pair { a: 1, b: "p".into() },
            Pair { a: 2, b: "q".into() },
        ];
        let mut writer = BinaryWriter::new();
        helper::serialize_array(&items, &mut writer).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = MemoryReader::new(&bytes);
        let decoded: Vec<Pair> = helper::deserialize_array(&mut reader, "pairs", 16).unwrap();
        assert_eq!(decoded, items);

        let mut reader = MemoryReader::new(&bytes);
        let err = helper::deserialize_array::<Pair>(&mut reader, "pairs", 1).unwrap_err();
        assert!(matches!(err, crate::IoError::LimitExceeded { .. }));
    }
}
