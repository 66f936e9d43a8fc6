//! Directories, hard links, symbolic links, and the reuse discipline.

use tern_core::proto::SeekWhence;
use tern_fs::layout::InodeType;
use tern_fs::FsError;

use crate::common::TestFs;

pub mod common;

#[tokio::test]
async fn mkdir_and_walk() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/a").await.unwrap();
    client.mkdir("/a/b").await.unwrap();
    client.create("/a/b/f").await.unwrap();

    let stat = client.stat("/a/b").await.unwrap();
    assert_eq!(stat.kind, InodeType::Directory);
    // "." and "..", plus one from the parent's entry for b... which lives
    // in /a: b itself has 2 links until it gains a subdirectory.
    assert_eq!(stat.nlink, 2);
    // /a gained a link from b's "..".
    assert_eq!(client.stat("/a").await.unwrap().nlink, 3);

    // Dot components are ordinary entries.
    assert!(client.stat("/a/b/./../b/f").await.is_ok());
}

#[tokio::test]
async fn trailing_slash_requires_a_directory() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/d").await.unwrap();
    client.create("/d/f").await.unwrap();

    assert!(client.open("/d/").await.is_ok());
    // "f/" normalizes to "f/." and f is not a directory.
    assert!(client.open("/d/f/").await.is_err());
}

#[tokio::test]
async fn hard_links_share_content_and_counts() {
    let fs = TestFs::new();
    let mut client = fs.client();

    let fd = client.create("/orig").await.unwrap();
    client.write(fd, b"shared").await.unwrap();

    client.link("/orig", "/alias").await.unwrap();
    assert_eq!(client.stat("/orig").await.unwrap().nlink, 2);
    assert_eq!(
        client.stat("/orig").await.unwrap().inum,
        client.stat("/alias").await.unwrap().inum
    );

    // Linking over an existing name fails.
    assert!(client.link("/orig", "/alias").await.is_err());
    // Directories cannot be hard-linked.
    client.mkdir("/dir").await.unwrap();
    assert!(client.link("/dir", "/dirlink").await.is_err());

    client.unlink("/orig").await.unwrap();
    assert_eq!(client.stat("/alias").await.unwrap().nlink, 1);
    assert!(client.stat("/orig").await.is_err());

    let fd = client.open("/alias").await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(fd, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"shared");
}

#[tokio::test]
async fn unlink_rules() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/d").await.unwrap();
    assert!(matches!(
        client.unlink("/d").await,
        Err(FsError::RequestFailed)
    ));
    assert!(client.unlink("/absent").await.is_err());
}

#[tokio::test]
async fn symlink_round_trip() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.create("/target").await.unwrap();
    client.symlink("/target", "/ln").await.unwrap();

    let mut buf = [0u8; 64];
    let n = client.read_link("/ln", &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"/target");

    // A short buffer gets a prefix.
    let mut small = [0u8; 3];
    let n = client.read_link("/ln", &mut small).await.unwrap();
    assert_eq!(&small[..n], b"/ta");

    // Stat does not follow the final symlink; Open does.
    assert_eq!(
        client.stat("/ln").await.unwrap().kind,
        InodeType::Symlink
    );
    assert_eq!(
        client.stat("/ln").await.unwrap().size,
        b"/target".len() as i32
    );
    assert!(client.open("/ln").await.is_ok());

    // ReadLink on a non-symlink fails.
    assert!(client.read_link("/target", &mut buf).await.is_err());
}

#[tokio::test]
async fn dangling_symlink_create_then_open() {
    let fs = TestFs::new();
    let mut client = fs.client();

    // Creating a symlink to a missing target succeeds; opening through it
    // fails until the target exists.
    client.symlink("/missing", "/ln").await.unwrap();
    assert!(client.open("/ln").await.is_err());

    client.create("/missing").await.unwrap();
    assert!(client.open("/ln").await.is_ok());
}

#[tokio::test]
async fn create_through_symlink_with_trailing_slash() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/a").await.unwrap();
    client.mkdir("/a/b").await.unwrap();
    client.symlink("d/f.txt", "/a/b/c").await.unwrap();
    client.mkdir("/a/b/d").await.unwrap();

    // The trailing slash forces the final symlink to resolve, so the
    // create lands on the link's target.
    client.create("/a/b/c/").await.unwrap();
    let stat = client.stat("/a/b/d/f.txt").await.unwrap();
    assert_eq!(stat.kind, InodeType::Regular);
    assert_eq!(stat.size, 0);
}

#[tokio::test]
async fn symlinks_resolve_mid_path() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/real").await.unwrap();
    let fd = client.create("/real/f").await.unwrap();
    client.write(fd, b"via link").await.unwrap();

    client.symlink("/real", "/ln").await.unwrap();
    let fd = client.open("/ln/f").await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(fd, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"via link");
}

#[tokio::test]
async fn symlink_cycles_are_bounded() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.symlink("/two", "/one").await.unwrap();
    client.symlink("/one", "/two").await.unwrap();
    assert!(client.open("/one").await.is_err());

    // A self-link is the tightest cycle.
    client.symlink("/me", "/me").await.unwrap();
    assert!(client.open("/me").await.is_err());
}

#[tokio::test]
async fn rmdir_rules() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/d").await.unwrap();
    client.create("/d/f").await.unwrap();

    assert!(matches!(
        client.rmdir("/").await,
        Err(FsError::ArgumentInvalid(_))
    ));
    assert!(matches!(
        client.rmdir("/d/.").await,
        Err(FsError::ArgumentInvalid(_))
    ));
    assert!(matches!(
        client.rmdir("/d/..").await,
        Err(FsError::ArgumentInvalid(_))
    ));
    // Still populated.
    assert!(client.rmdir("/d").await.is_err());
    // Removing a non-directory is refused.
    assert!(client.rmdir("/d/f").await.is_err());

    client.unlink("/d/f").await.unwrap();
    client.rmdir("/d").await.unwrap();
    assert!(client.stat("/d").await.is_err());
    assert_eq!(client.stat("/").await.unwrap().nlink, 2);
}

#[tokio::test]
async fn chdir_makes_relative_paths_work() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/w").await.unwrap();
    client.chdir("/w").await.unwrap();
    client.create("local").await.unwrap();
    assert!(client.stat("/w/local").await.is_ok());

    client.chdir("..").await.unwrap();
    assert!(client.stat("w/local").await.is_ok());

    // ChDir requires a directory.
    assert!(client.chdir("/w/local").await.is_err());
}

#[tokio::test]
async fn stale_file_handle_after_inode_reuse() {
    let fs = TestFs::new();
    let mut client = fs.client();

    client.mkdir("/d").await.unwrap();
    client.create("/d/f").await.unwrap();
    let victim = client.open("/d/f").await.unwrap();

    // Drop the last link; the inode is freed and the next create reuses
    // it with a bumped reuse count.
    let mut other = fs.client();
    other.unlink("/d/f").await.unwrap();
    other.create("/d/g").await.unwrap();
    assert_eq!(
        client.stat("/d/g").await.unwrap().inum,
        // The freed inode is the lowest one, so it is handed right back.
        other.stat("/d/g").await.unwrap().inum
    );

    let mut buf = [0u8; 4];
    assert!(client.read(victim, &mut buf).await.is_err());
    assert!(client.write(victim, b"x").await.is_err());
    assert!(client.seek(victim, 0, SeekWhence::Set).await.is_err());
}

#[tokio::test]
async fn removed_cwd_is_detected_on_reuse() {
    let fs = TestFs::new();
    let mut resident = fs.client();
    let mut janitor = fs.client();

    resident.mkdir("/home").await.unwrap();
    resident.chdir("/home").await.unwrap();

    janitor.rmdir("/home").await.unwrap();
    // The directory inode is gone; relative operations fail.
    assert!(resident.create("f").await.is_err());

    // Once the inode is reallocated, the reuse stamp mismatch makes the
    // failure a stale handle rather than a lucky hit on the new file.
    janitor.mkdir("/other").await.unwrap();
    assert!(resident.create("f").await.is_err());
    assert!(janitor.stat("/other/f").await.is_err());
}

#[tokio::test]
async fn directories_grow_past_one_block() {
    let fs = TestFs::with_geometry(512, 127);
    let mut client = fs.client();

    // The root block holds 16 entries; push well past it.
    for i in 0..40 {
        client.create(&format!("/file{i:02}")).await.unwrap();
    }
    for i in 0..40 {
        assert!(client.stat(&format!("/file{i:02}")).await.is_ok());
    }

    // Free a slot in the middle and watch it be reused without growing.
    let before = client.stat("/").await.unwrap().size;
    client.unlink("/file07").await.unwrap();
    client.create("/replacement").await.unwrap();
    assert_eq!(client.stat("/").await.unwrap().size, before);
}
