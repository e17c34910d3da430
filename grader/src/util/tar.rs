//! Operations related to TAR archives

use std::{
    path::{Path, PathBuf},
    pin::Pin,
};

use bytes::BytesMut;
use futures::{Future, FutureExt, Stream};
use tokio::{io::DuplexStream, task::JoinHandle};
use tokio_tar::{Builder, Header};

use super::fs::sorted_entries;

/// Spawn a task to pack the given `path` into a Tar file. Entries are named
/// relative to `path`.
///
/// Returns the tar file stream to read from and the join handle to the packing
/// task.
pub fn pack_as_tar(
    path: PathBuf,
) -> (
    impl Stream<Item = Result<BytesMut, std::io::Error>> + Send + 'static,
    JoinHandle<Result<(), std::io::Error>>,
) {
    let (pipe_recv, pipe_send) = tokio::io::duplex(8192);
    let read_codec = tokio_util::codec::BytesCodec::new();
    let frame = tokio_util::codec::FramedRead::new(pipe_send, read_codec);

    let task = async move {
        let mut tar = Builder::new(pipe_recv);
        add_dir(&path, &path, &mut tar).await?;
        tar.finish().await?;
        Ok(())
    };
    (frame, tokio::spawn(task))
}

/// Add the given directory into the given tar, recursively and in name order.
fn add_dir<'a>(
    root: &'a Path,
    dir: &'a Path,
    tar: &'a mut Builder<DuplexStream>,
) -> Pin<Box<dyn Future<Output = Result<(), std::io::Error>> + Send + 'a>> {
    async move {
        for path in sorted_entries(dir).await? {
            let meta = tokio::fs::metadata(&path).await?;
            let name = path
                .strip_prefix(root)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

            if meta.is_dir() {
                let mut header = Header::new_gnu();
                header.set_metadata(&meta);
                tar.append_data(&mut header, name, tokio::io::empty()).await?;
                add_dir(root, &path, tar).await?;
            } else if meta.is_file() {
                let mut file = tokio::fs::File::open(&path).await?;
                let mut header = Header::new_gnu();
                header.set_metadata(&meta);
                tar.append_data(&mut header, name, &mut file).await?;
            }
        }
        Ok(())
    }
    .boxed()
}
