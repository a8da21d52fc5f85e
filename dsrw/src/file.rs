use std::path::Path;
use tracing::info;
use transport::channel::Channel;
use transport::error::Fatal;
use crate::data::MultiArray;
use crate::format::Padding;
use crate::read::DsReader;
use crate::write::DsWriter;

const FILE_WRITE_BUFFER: usize = 64 * 1024;

/// Writes a multi array to a (padded) container file
pub async fn put_multi_file(path: &Path, multi: &MultiArray) -> anyhow::Result<()> {
    let mut channel = Channel::create_file(path, FILE_WRITE_BUFFER).await?;
    DsWriter::new(&mut channel, Padding::Aligned).write_multi(multi).await?;
    channel.flush().await
        .map_err(|e| Fatal::short_write("container file", e))?;
    info!("wrote {:?}", path);
    Ok(())
}

/// Reads a container file. With `mmap`, the file is memory mapped and array data is not
///  copied where its packed representation matches the file.
pub async fn get_multi_file(path: &Path, mmap: bool) -> anyhow::Result<MultiArray> {
    let mut channel = if mmap {
        Channel::open_mapped(path)?
    }
    else {
        Channel::open_file(path).await?
    };
    let multi = DsReader::new(&mut channel, Padding::Aligned).read_multi().await?;
    info!("read {:?}", path);
    Ok(multi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::data::{ArrayData, Packet, Value};
    use crate::desc::{ArrayDesc, DimDesc, ElementDesc, PacketDesc};
    use crate::types::{AtomicType, AtomicValue, Scalar, ScalarValue};

    fn cube() -> MultiArray {
        let voxel = PacketDesc::single("flux", AtomicType::real(Scalar::F32));
        let array = ArrayDesc::new(vec![
            DimDesc::regular("freq", 3, 1.4e9, 1.6e9),
            DimDesc::regular("dec", 4, -30.0, -29.0),
            DimDesc::regular("ra", 5, 10.0, 11.0),
        ], voxel.clone());
        let packets = (0..60)
            .map(|i| Packet::atomic(AtomicValue::Real(ScalarValue::F32(i as f32 * 0.5))))
            .collect();
        let mut multi = MultiArray::single(
            PacketDesc::new(vec![ElementDesc::Array(Box::new(array))]),
            Packet::new(vec![Value::Array(ArrayData::from_packets(&voxel, packets))]),
        );
        multi.add_history("observed").unwrap();
        multi
    }

    #[rstest]
    #[case::buffered(false)]
    #[case::mapped(true)]
    #[tokio::test]
    async fn test_file_round_trip(#[case] mmap: bool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.kf");

        put_multi_file(&path, &cube()).await.unwrap();
        let read_back = get_multi_file(&path, mmap).await.unwrap();
        assert_eq!(read_back, cube());
    }

    #[tokio::test]
    async fn test_same_tree_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.kf");
        let b = dir.path().join("b.kf");

        put_multi_file(&a, &cube()).await.unwrap();
        put_multi_file(&b, &cube()).await.unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    }

    #[tokio::test]
    async fn test_array_data_is_aligned_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.kf");
        put_multi_file(&path, &cube()).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // 60 floats, followed by the end of history (4 bytes) after "observed" (4 + 8 bytes)
        let data_start = bytes.len() - 4 - 12 - 60 * 4;
        assert_eq!(data_start % 16, 0);
        assert_eq!(&bytes[data_start + 4..data_start + 8], &0.5f32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_multi_file(&dir.path().join("missing.kf"), true).await.is_err());
        assert!(get_multi_file(&dir.path().join("missing.kf"), false).await.is_err());
    }
}
