use channel::{Channel, Config, Error, Position, StartPoint};
use tokio_util::sync::CancellationToken;

fn config(dir: &tempfile::TempDir) -> Config {
    Config {
        dir: dir.path().to_path_buf(),
    }
}

async fn open(dir: &tempfile::TempDir) -> Channel {
    Channel::recover(config(dir)).await.unwrap()
}

// Seed a run holding an RDB snapshot anchored at `anchor` plus `aof` bytes.
async fn seed(channel: &Channel, run_id: &str, anchor: i64, rdb: &[u8], aof: &[u8]) {
    let cancel = CancellationToken::new();
    channel.set_run_id(run_id).await.unwrap();

    let mut writer = channel
        .new_rdb_writer(rdb, anchor, rdb.len() as i64)
        .await
        .unwrap();
    writer.run(&cancel).await.unwrap();
    drop(writer);

    if !aof.is_empty() {
        let mut writer = channel.new_aof_writer(aof, anchor).await.unwrap();
        writer.run(&cancel).await.unwrap();
    }
}

async fn read_all(reader: &mut channel::Reader, limit: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 7]; // deliberately odd to exercise chunk boundaries
    while out.len() < limit {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[tokio::test]
async fn snapshot_reader_continues_into_aof_without_seam() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    seed(&channel, "run-a", 1000, b"snapshot-bytes", b"aof-bytes").await;

    let sp = channel.start_point(None);
    assert_eq!(
        sp,
        StartPoint {
            run_id: "run-a".to_string(),
            offset: 1009,
        }
    );

    let mut reader = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: channel::INITIAL_OFFSET,
        })
        .await
        .unwrap();
    assert!(!reader.is_aof());
    assert_eq!(reader.left(), 1000);
    assert_eq!(reader.size(), 14);

    let bytes = read_all(&mut reader, usize::MAX).await;
    assert_eq!(&bytes, b"snapshot-bytesaof-bytes");
}

#[tokio::test]
async fn snapshot_only_stream_is_finite() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    seed(&channel, "run-a", 0, b"only-the-snapshot", b"").await;

    let mut reader = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: channel::INITIAL_OFFSET,
        })
        .await
        .unwrap();
    let bytes = read_all(&mut reader, usize::MAX).await;
    assert_eq!(&bytes, b"only-the-snapshot");

    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn suffix_reads_agree_with_positioned_reads() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    seed(&channel, "run-a", 100, b"s", b"abcdefghijklmnopqrstuvwxyz").await;
    channel.close();

    // A reader opened at o1 and continued must match a reader opened at o2
    // from the (o2 - o1)'th byte on.
    let (o1, o2) = (103, 110);
    let mut r1 = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: o1,
        })
        .await
        .unwrap();
    assert!(r1.is_aof());
    assert_eq!(r1.left(), o1);
    assert_eq!(r1.size(), -1);
    let from_o1 = read_all(&mut r1, usize::MAX).await;

    let mut r2 = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: o2,
        })
        .await
        .unwrap();
    let from_o2 = read_all(&mut r2, usize::MAX).await;

    assert_eq!(from_o1[(o2 - o1) as usize..], from_o2[..]);
    assert_eq!(&from_o1, b"defghijklmnopqrstuvwxyz");
}

#[tokio::test]
async fn tail_reader_observes_concurrent_appends() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    seed(&channel, "run-a", 0, b"s", b"").await;

    let (mut source, sink) = tokio::io::duplex(64);
    let mut writer = channel.new_aof_writer(sink, 0).await.unwrap();
    let cancel = CancellationToken::new();
    let append = tokio::spawn(async move { writer.run(&cancel).await });

    let mut reader = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: 0,
        })
        .await
        .unwrap();

    use tokio::io::AsyncWriteExt;
    let mut expect = Vec::new();
    let mut buf = [0u8; 32];
    for chunk in [&b"first "[..], b"second ", b"third"] {
        source.write_all(chunk).await.unwrap();
        expect.extend_from_slice(chunk);

        // The reader blocks at the head until the append is durable, then
        // yields exactly the appended bytes, in order, with no gaps.
        let mut got = Vec::new();
        while got.len() < chunk.len() {
            let n = reader.read(&mut buf).await.unwrap();
            assert_ne!(n, 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, chunk);
    }
    drop(source);
    append.await.unwrap().unwrap();

    assert_eq!(
        channel.start_point(None).offset,
        expect.len() as i64,
        "head advanced by every appended byte",
    );
}

#[tokio::test]
async fn blocked_reader_returns_eof_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    seed(&channel, "run-a", 0, b"s", b"abc").await;

    let mut reader = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: 3,
        })
        .await
        .unwrap();

    let closer = channel.clone();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        reader.read(&mut buf).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    closer.close();

    assert_eq!(task.await.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn discarded_run_fails_readers_terminally() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    seed(&channel, "run-a", 0, b"s", b"abcdef").await;

    let mut reader = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: 0,
        })
        .await
        .unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 3);

    channel.del_run_id("run-a").await.unwrap();
    assert!(matches!(
        reader.read(&mut buf).await,
        Err(Error::Discarded(_))
    ));

    // Deleting also resets the replay start point.
    assert!(channel.start_point(None).is_initial());
    let accepted = vec!["run-a".to_string()];
    assert!(channel.start_point(Some(&accepted)).is_initial());
}

#[tokio::test]
async fn supplanting_run_fails_readers_of_the_old_run() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    seed(&channel, "run-a", 0, b"s", b"abc").await;

    let mut reader = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: 0,
        })
        .await
        .unwrap();

    channel.set_run_id("run-b").await.unwrap();
    let mut buf = [0u8; 3];
    assert!(matches!(
        reader.read(&mut buf).await,
        Err(Error::Discarded(_))
    ));
}

#[tokio::test]
async fn writers_are_exclusive_and_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    channel.set_run_id("run-a").await.unwrap();

    // No AOF append before a snapshot prefix exists.
    assert!(matches!(
        channel.new_aof_writer(&b"x"[..], 0).await,
        Err(Error::NoSnapshot(_))
    ));

    let writer = channel.new_rdb_writer(&b"0123"[..], 0, 4).await.unwrap();
    assert!(matches!(
        channel.new_rdb_writer(&b"0123"[..], 0, 4).await,
        Err(Error::WriterLive(_))
    ));
    drop(writer);

    let mut writer = channel.new_rdb_writer(&b"0123"[..], 0, 4).await.unwrap();
    writer.run(&CancellationToken::new()).await.unwrap();
    drop(writer);

    assert!(matches!(
        channel.new_rdb_writer(&b"0123"[..], 0, 4).await,
        Err(Error::SnapshotExists(_))
    ));

    // AOF appends must meet the head exactly.
    assert!(matches!(
        channel.new_aof_writer(&b"x"[..], 7).await,
        Err(Error::NotAtHead { .. })
    ));
    let mut writer = channel.new_aof_writer(&b"xyz"[..], 0).await.unwrap();
    writer.run(&CancellationToken::new()).await.unwrap();
    drop(writer);
    assert_eq!(channel.start_point(None).offset, 3);
}

#[tokio::test]
async fn short_snapshot_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let channel = open(&dir).await;
    channel.set_run_id("run-a").await.unwrap();

    let mut writer = channel.new_rdb_writer(&b"abc"[..], 0, 10).await.unwrap();
    assert!(matches!(
        writer.run(&CancellationToken::new()).await,
        Err(Error::SnapshotSize {
            expected: 10,
            got: 3,
        })
    ));

    // The failed snapshot was never published.
    assert_eq!(channel.start_point(None).offset, channel::INITIAL_OFFSET);
}

#[tokio::test]
async fn state_recovers_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let channel = open(&dir).await;
        seed(&channel, "run-a", 500, b"snapshot!", b"tail-bytes").await;
        channel.close();
    }

    let channel = open(&dir).await;
    assert_eq!(channel.run_id(), "run-a");
    assert_eq!(channel.start_point(None).offset, 510);

    let mut reader = channel
        .new_reader(Position {
            run_id: "run-a".to_string(),
            offset: channel::INITIAL_OFFSET,
        })
        .await
        .unwrap();
    assert_eq!(reader.left(), 500);
    assert_eq!(reader.size(), 9);
    let bytes = read_all(&mut reader, usize::MAX).await;
    assert_eq!(&bytes, b"snapshot!tail-bytes");

    // Appends resume at the recovered head.
    let mut writer = channel.new_aof_writer(&b"++"[..], 510).await.unwrap();
    writer.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(channel.start_point(None).offset, 512);
}

#[tokio::test]
async fn recovery_sweeps_runs_which_are_not_current() {
    let dir = tempfile::tempdir().unwrap();
    {
        let channel = open(&dir).await;
        seed(&channel, "run-a", 0, b"s", b"abc").await;
        // Supplant run-a; its directory stays behind until recovery.
        channel.set_run_id("run-b").await.unwrap();
    }

    let channel = open(&dir).await;
    assert_eq!(channel.run_id(), "run-b");
    assert!(!dir.path().join("run-a").exists());
}
