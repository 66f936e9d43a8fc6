use async_channel::Sender;
use tern_core::ipc::Envelope;
use tern_fs::disk::MemDisk;
use tern_fs::{mkfs, FsClient, FsServer};

/// An ephemeral, isolated file server created for each test: a formatted
/// in-memory disk with the server task running over a bounded request
/// queue.
pub struct TestFs {
    requests: Sender<Envelope>,
}

impl TestFs {
    /// A server on a moderately sized disk.
    pub fn new() -> Self {
        Self::with_geometry(512, 127)
    }

    /// A server with explicit disk geometry.
    pub fn with_geometry(blocks: i32, inodes: i32) -> Self {
        let mut disk = MemDisk::new(blocks as usize);
        mkfs::format(&mut disk, blocks, inodes).unwrap();
        let server = FsServer::new(disk).unwrap();

        let (requests, queue) = async_channel::bounded(256);
        tokio::spawn(async move {
            server.serve(queue).await.unwrap();
        });
        TestFs { requests }
    }

    /// A fresh client connection; each client has its own descriptor table
    /// and working directory.
    pub fn client(&self) -> FsClient {
        FsClient::new(self.requests.clone())
    }
}
