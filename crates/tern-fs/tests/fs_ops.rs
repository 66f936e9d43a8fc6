//! File-level operations: create, read, write, seek, and their boundary
//! behavior.

use rand::{Rng, SeedableRng};
use tern_core::proto::SeekWhence;
use tern_fs::layout::{InodeType, BLOCKSIZE, MAX_FILE_SIZE, NUM_DIRECT};
use tern_fs::FsError;

use crate::common::TestFs;

pub mod common;

#[tokio::test]
async fn write_then_read_round_trip() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let fd = client.create("/notes").await.unwrap();
    assert_eq!(client.write(fd, b"hello, disk").await.unwrap(), 11);

    client.seek(fd, 0, SeekWhence::Set).await.unwrap();
    let mut buf = [0u8; 32];
    let n = client.read(fd, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello, disk");
}

#[tokio::test]
async fn large_file_crosses_into_indirect_blocks() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let payload: Vec<u8> = (0..NUM_DIRECT * BLOCKSIZE + 3 * BLOCKSIZE + 17)
        .map(|_| rng.gen())
        .collect();

    let fd = client.create("/big").await.unwrap();
    assert_eq!(client.write(fd, &payload).await.unwrap(), payload.len());

    client.seek(fd, 0, SeekWhence::Set).await.unwrap();
    let mut readback = vec![0u8; payload.len()];
    let mut got = 0;
    while got < readback.len() {
        let n = client.read(fd, &mut readback[got..]).await.unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(readback, payload);

    let stat = client.stat("/big").await.unwrap();
    assert_eq!(stat.size as usize, payload.len());
}

#[tokio::test]
async fn create_yields_empty_regular_file() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.create("/empty").await.unwrap();
    let stat = client.stat("/empty").await.unwrap();
    assert_eq!(stat.kind, InodeType::Regular);
    assert_eq!(stat.size, 0);
    assert_eq!(stat.nlink, 1);
}

#[tokio::test]
async fn recreate_truncates_existing_file() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let fd = client.create("/x").await.unwrap();
    client.write(fd, b"abc").await.unwrap();
    assert_eq!(client.stat("/x").await.unwrap().size, 3);

    let fd2 = client.create("/x").await.unwrap();
    assert_eq!(client.stat("/x").await.unwrap().size, 0);
    let mut buf = [0u8; 8];
    assert_eq!(client.read(fd2, &mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn seek_boundaries() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let fd = client.create("/s").await.unwrap();
    client.write(fd, b"0123456789").await.unwrap();

    // Negative absolute position is rejected; the cursor is unchanged.
    assert!(client.seek(fd, -1, SeekWhence::Set).await.is_err());

    // Seeking past EOF is allowed and reads nothing.
    assert_eq!(client.seek(fd, 5, SeekWhence::End).await.unwrap(), 15);
    let mut buf = [0u8; 4];
    assert_eq!(client.read(fd, &mut buf).await.unwrap(), 0);

    // Writing there backfills the gap with zeros.
    client.seek(fd, 15, SeekWhence::Set).await.unwrap();
    client.write(fd, b"zz").await.unwrap();
    assert_eq!(client.stat("/s").await.unwrap().size, 17);

    client.seek(fd, 0, SeekWhence::Set).await.unwrap();
    let mut all = [0u8; 17];
    assert_eq!(client.read(fd, &mut all).await.unwrap(), 17);
    assert_eq!(&all[..10], b"0123456789");
    assert_eq!(&all[10..15], &[0, 0, 0, 0, 0]);
    assert_eq!(&all[15..], b"zz");
}

#[tokio::test]
async fn relative_seek_moves_the_cursor() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let fd = client.create("/c").await.unwrap();
    client.write(fd, b"abcdef").await.unwrap();
    assert_eq!(client.seek(fd, -2, SeekWhence::Cur).await.unwrap(), 4);
    let mut buf = [0u8; 2];
    client.read(fd, &mut buf).await.unwrap();
    assert_eq!(&buf, b"ef");
}

#[tokio::test]
async fn max_file_size_is_a_hard_wall() {
    // Plenty of data blocks: the largest file needs 140 of them.
    let fs = TestFs::with_geometry(512, 31);
    let mut client = fs.client();

    let fd = client.create("/wall").await.unwrap();
    client
        .seek(fd, MAX_FILE_SIZE as i32 - 1, SeekWhence::Set)
        .await
        .unwrap();
    // The last byte is writable; the request is clamped at the wall.
    assert_eq!(client.write(fd, b"ab").await.unwrap(), 1);
    assert_eq!(client.stat("/wall").await.unwrap().size as usize, MAX_FILE_SIZE);

    // One byte past fails outright.
    client
        .seek(fd, MAX_FILE_SIZE as i32, SeekWhence::Set)
        .await
        .unwrap();
    assert!(client.write(fd, b"x").await.is_err());
}

#[tokio::test]
async fn open_missing_file_fails() {
    let fs = TestFs::new();
    let mut client = fs.client();
    assert!(matches!(
        client.open("/nope").await,
        Err(FsError::RequestFailed)
    ));
}

#[tokio::test]
async fn reading_a_directory_is_allowed() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let fd = client.open("/").await.unwrap();
    let mut buf = [0u8; 64];
    // The root directory starts with its "." and ".." entries.
    assert_eq!(client.read(fd, &mut buf).await.unwrap(), 64);
    assert!(buf[2..].starts_with(b"."));
}

#[tokio::test]
async fn descriptors_are_scarce() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let mut fds = Vec::new();
    for i in 0..tern_core::MAX_OPEN_FILES {
        fds.push(client.create(&format!("/f{i}")).await.unwrap());
    }
    assert!(matches!(
        client.open("/f0").await,
        Err(FsError::ResourceExhausted(_))
    ));

    client.close(fds[3]).unwrap();
    client.open("/f0").await.unwrap();

    // Closing twice is an error.
    assert!(client.close(fds[3]).is_err());
}

#[tokio::test]
async fn shutdown_stops_the_server() {
    let fs = TestFs::new();
    let mut client = fs.client();
    client.create("/left").await.unwrap();
    client.shutdown().await.unwrap();

    let mut late = fs.client();
    assert!(late.open("/left").await.is_err());
}

#[tokio::test]
async fn out_of_inodes_reports_exhaustion() {
    // Three inodes total: the root directory plus two free ones.
    let fs = TestFs::with_geometry(128, 3);
    let mut client = fs.client();
    client.create("/a").await.unwrap();
    client.create("/b").await.unwrap();
    assert!(client.create("/c").await.is_err());
}
