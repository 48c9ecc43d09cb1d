// Integration tests for the Redis hot cache.
//
// These need a Redis server at 127.0.0.1:6379 and are ignored by default;
// run them with `cargo test -- --ignored`. Keys are randomized so parallel
// runs do not collide.

use timebatch::cache::HotCache;
use timebatch::core::{Datapoint, DatapointArray, StreamPath};
use timebatch::Error;
use uuid::Uuid;

async fn cache(batch_size: i64) -> HotCache {
    HotCache::connect("redis://127.0.0.1:6379", batch_size)
        .await
        .expect("redis not reachable")
}

fn unique_path(name: &str) -> StreamPath {
    StreamPath::new(format!("{name}-{}", Uuid::new_v4()))
}

fn unique_id(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4())
}

fn dpa(points: &[(i64, &str)]) -> DatapointArray {
    points
        .iter()
        .map(|(t, s)| Datapoint::new(*t, s.as_bytes().to_vec()))
        .collect()
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_insert_and_length() {
    let cache = cache(250).await;
    let path = unique_path("basics");
    let writer = unique_id("w");

    assert_eq!(cache.length(&path).await.unwrap(), 0);

    let points = dpa(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]);
    assert_eq!(cache.insert(&writer, &path, &points, false).await.unwrap(), 5);
    assert_eq!(cache.length(&path).await.unwrap(), 5);
    assert_eq!(cache.last_timestamp(&path).await.unwrap(), Some(5));

    cache.delete(&path).await.unwrap();
    assert_eq!(cache.length(&path).await.unwrap(), 0);
    assert_eq!(cache.last_timestamp(&path).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_batch_cut_order_and_equal_timestamps() {
    let cache = cache(2).await;
    let path = unique_path("cut");
    let writer = unique_id("w");

    let points = dpa(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]);
    cache.insert(&writer, &path, &points, false).await.unwrap();

    let queue = cache.writer_queue(&writer).await.unwrap();
    assert_eq!(
        queue,
        vec![
            format!("{}:2:4", path.list_key()),
            format!("{}:0:2", path.list_key()),
        ]
    );

    // The plain cache insert accepts an equal first timestamp
    assert_eq!(
        cache
            .insert(&writer, &path, &dpa(&[(5, "f"), (6, "g")]), false)
            .await
            .unwrap(),
        7
    );
    // But rejects a strictly older one
    let err = cache
        .insert(&writer, &path, &dpa(&[(1, "x")]), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ordering));

    let queue = cache.writer_queue(&writer).await.unwrap();
    assert_eq!(queue.len(), 3);
    assert_eq!(queue[0], format!("{}:4:6", path.list_key()));
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_restamp_clamps_to_running_max() {
    let cache = cache(250).await;
    let path = unique_path("restamp");
    let writer = unique_id("w");

    cache
        .insert(&writer, &path, &dpa(&[(1, "a"), (5, "b")]), false)
        .await
        .unwrap();
    cache
        .insert(&writer, &path, &dpa(&[(1, "c"), (2, "d")]), true)
        .await
        .unwrap();

    let (_, data) = cache.get(&path).await.unwrap();
    let ts: Vec<i64> = data.iter().map(|d| d.timestamp).collect();
    assert_eq!(ts, vec![1, 5, 5, 5]);
    assert_eq!(data[2].data, b"c".to_vec());
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_next_read_ack_cycle() {
    let cache = cache(2).await;
    let path = unique_path("cycle");
    let writer = unique_id("w");
    let done = unique_id("d");

    let points = dpa(&[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]);
    cache.insert(&writer, &path, &points, false).await.unwrap();

    let desc = cache.next_batch(&writer, &done).await.unwrap().unwrap();
    assert_eq!(desc.start, 0);
    assert_eq!(desc.end, 2);
    assert_eq!(cache.done_queue(&done).await.unwrap().len(), 1);
    assert_eq!(cache.writer_queue(&writer).await.unwrap().len(), 1);

    let batch = cache.read_batch(&desc).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].data, b"a".to_vec());
    // Reading does not remove anything
    assert_eq!(cache.length(&path).await.unwrap(), 5);

    cache.ack_batch(&done, &desc).await.unwrap();
    assert!(cache.done_queue(&done).await.unwrap().is_empty());
    assert_eq!(cache.start_index(&path).await.unwrap(), 2);
    assert_eq!(cache.cold_length(&path).await.unwrap(), 2);
    // Total length is unchanged by migration bookkeeping
    assert_eq!(cache.length(&path).await.unwrap(), 5);

    // An empty queue pops nothing
    let none = cache.next_batch(&unique_id("empty"), &done).await.unwrap();
    assert!(none.is_none());
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_done_queue_recovery() {
    let cache = cache(2).await;
    let path = unique_path("recover");
    let writer = unique_id("w");
    let done = unique_id("d");

    cache
        .insert(&writer, &path, &dpa(&[(1, "a"), (2, "b"), (3, "c"), (4, "d")]), false)
        .await
        .unwrap();

    cache.next_batch(&writer, &done).await.unwrap().unwrap();
    cache.next_batch(&writer, &done).await.unwrap().unwrap();
    assert_eq!(cache.done_queue(&done).await.unwrap().len(), 2);
    assert!(cache.writer_queue(&writer).await.unwrap().is_empty());

    assert_eq!(cache.recover_done_queue(&done, &writer).await.unwrap(), 2);
    assert!(cache.done_queue(&done).await.unwrap().is_empty());

    // Oldest batch pops first again
    let desc = cache.next_batch(&writer, &done).await.unwrap().unwrap();
    assert_eq!(desc.start, 0);
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_trim_and_range_misses() {
    let cache = cache(250).await;
    let path = unique_path("trim");
    let writer = unique_id("w");

    let points: DatapointArray = (1..=9)
        .map(|i| Datapoint::new(i, format!("test{i}").into_bytes()))
        .collect();
    cache.insert(&writer, &path, &points, false).await.unwrap();

    cache.trim(&path, 3).await.unwrap();
    assert_eq!(cache.length(&path).await.unwrap(), 9);
    let (start, data) = cache.get(&path).await.unwrap();
    assert_eq!(start, 3);
    assert_eq!(data.len(), 6);

    // Trimming to a smaller index does not restore anything
    cache.trim(&path, 2).await.unwrap();
    assert_eq!(cache.get(&path).await.unwrap().1.len(), 6);

    // A range reaching below the trimmed head reports bounds but no data
    let (i1, i2, data) = cache.range(&path, 2, 0).await.unwrap();
    assert_eq!((i1, i2), (2, 9));
    assert!(data.is_empty());

    // Whole-suffix ranges still read normally
    let (i1, i2, data) = cache.range(&path, 3, 0).await.unwrap();
    assert_eq!((i1, i2), (3, 9));
    assert_eq!(data.len(), 6);

    // Negative indices resolve against the total length
    let (i1, i2, data) = cache.range(&path, -2, -1).await.unwrap();
    assert_eq!((i1, i2), (7, 8));
    assert_eq!(data[0].data, b"test8".to_vec());

    assert!(cache.range(&path, -20, 0).await.is_err());
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_bulk_insert_beyond_script_argument_ceiling() {
    let cache = cache(250).await;
    let path = unique_path("bulk");
    let writer = unique_id("w");

    let points: DatapointArray = (0..6007)
        .map(|i| Datapoint::new(i, b"x".to_vec()))
        .collect();
    assert_eq!(
        cache.insert(&writer, &path, &points, false).await.unwrap(),
        6007
    );
    assert_eq!(cache.length(&path).await.unwrap(), 6007);

    let (i1, i2, data) = cache.range(&path, 6000, 0).await.unwrap();
    assert_eq!((i1, i2), (6000, 6007));
    assert_eq!(data.len(), 7);
    assert_eq!(data[0].timestamp, 6000);
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_delete_with_glob_metacharacters_stays_literal() {
    let cache = cache(250).await;
    let ns = Uuid::new_v4();
    let starred = StreamPath::new(format!("lit*eral-{ns}"));
    let plain = StreamPath::new(format!("litXeral-{ns}"));
    let writer = unique_id("w");

    cache
        .insert(&writer, &starred, &dpa(&[(1, "a")]), false)
        .await
        .unwrap();
    cache
        .insert(&writer, &plain, &dpa(&[(1, "b")]), false)
        .await
        .unwrap();

    // '*' in the stream name must not widen the delete pattern
    cache.delete(&starred).await.unwrap();
    assert_eq!(cache.length(&starred).await.unwrap(), 0);
    assert_eq!(cache.length(&plain).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires a local Redis at 127.0.0.1:6379"]
async fn test_substream_partitioning() {
    let cache = cache(250).await;
    let base = unique_path("subs");
    let sub = base.clone().with_substream("s1");
    let writer = unique_id("w");

    cache
        .insert(&writer, &sub, &dpa(&[(1, "a"), (2, "b")]), false)
        .await
        .unwrap();
    assert_eq!(cache.length(&base).await.unwrap(), 0);
    assert_eq!(cache.length(&sub).await.unwrap(), 2);

    cache.delete_substream(&sub).await.unwrap();
    assert_eq!(cache.length(&sub).await.unwrap(), 0);
}
