use std::path::PathBuf;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use super::*;

const H: Ms = 3_600_000;
const BASE: Ms = 1_900_000_000_000; // 2030-03-17, far from any clock skew

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("allocra_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

async fn store_with_room(name: &str) -> (Store, RoomId) {
    let store = Store::open(&test_wal_path(name)).unwrap();
    let room = store
        .register_room("Seminar 1".into(), 10, RoomKind::Shared, RoomStatus::Online)
        .await
        .unwrap();
    (store, room.id)
}

fn new_booking(room_id: RoomId, start: Ms, end: Ms) -> NewBooking {
    NewBooking {
        room_id,
        requester_id: Ulid::new(),
        span: Span::new(start, end),
    }
}

async fn insert_committed(store: &Store, room_id: RoomId, start: Ms, end: Ms, status: BookingStatus) -> Booking {
    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    let b = tx.insert_booking(new_booking(room_id, start, end), status).await.unwrap();
    tx.commit().await.unwrap();
    b
}

#[tokio::test]
async fn register_room_validates() {
    let store = Store::open(&test_wal_path("register_validates.wal")).unwrap();
    let empty = store
        .register_room("  ".into(), 1, RoomKind::Shared, RoomStatus::Online)
        .await;
    assert!(matches!(empty, Err(StoreError::InvalidRoom(_))));
    let zero = store
        .register_room("Lab".into(), 0, RoomKind::Shared, RoomStatus::Online)
        .await;
    assert!(matches!(zero, Err(StoreError::InvalidRoom(_))));
    let long = store
        .register_room("x".repeat(MAX_ROOM_NAME_LEN + 1), 1, RoomKind::Shared, RoomStatus::Online)
        .await;
    assert!(matches!(long, Err(StoreError::LimitExceeded(_))));
    assert_eq!(store.room_count(), 0);
}

#[tokio::test]
async fn committed_insert_is_visible_and_durable() {
    let path = test_wal_path("insert_durable.wal");
    let store = Store::open(&path).unwrap();
    let room = store
        .register_room("Board room".into(), 12, RoomKind::Exclusive, RoomStatus::Maintenance)
        .await
        .unwrap();
    let b = insert_committed(&store, room.id, BASE, BASE + H, BookingStatus::Approved).await;

    assert_eq!(store.booking(b.id).await, Some(b.clone()));
    drop(store);

    let reopened = Store::open(&path).unwrap();
    assert_eq!(reopened.room(room.id).await, Some(room));
    assert_eq!(reopened.booking(b.id).await, Some(b));
}

#[tokio::test]
async fn explicit_rollback_discards_writes() {
    let (store, rid) = store_with_room("explicit_rollback.wal").await;
    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    let b = tx
        .insert_booking(new_booking(rid, BASE, BASE + H), BookingStatus::Approved)
        .await
        .unwrap();
    tx.rollback();
    tx.rollback(); // idempotent

    assert!(store.booking(b.id).await.is_none());
    let rooms = store.scan(soon()).await.unwrap();
    assert!(rooms[0].bookings.is_empty());
}

#[tokio::test]
async fn dropped_transaction_rolls_back() {
    let (store, rid) = store_with_room("drop_rollback.wal").await;
    let existing = insert_committed(&store, rid, BASE, BASE + H, BookingStatus::Approved).await;
    {
        let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
        let rows = tx
            .update_status(existing.id, None, BookingStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        tx.insert_booking(new_booking(rid, BASE + H, BASE + 2 * H), BookingStatus::Approved)
            .await
            .unwrap();
    }
    let rooms = store.scan(soon()).await.unwrap();
    assert_eq!(rooms[0].bookings, vec![existing]);
}

#[tokio::test]
async fn commit_after_commit_fails_and_rollback_is_noop() {
    let (store, rid) = store_with_room("double_commit.wal").await;
    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    let b = tx
        .insert_booking(new_booking(rid, BASE, BASE + H), BookingStatus::Pending)
        .await
        .unwrap();
    assert_ok!(tx.commit().await);
    tx.rollback();
    assert!(matches!(tx.commit().await, Err(StoreError::TxFinished)));
    assert_eq!(store.booking(b.id).await.map(|b| b.status), Some(BookingStatus::Pending));
}

#[tokio::test]
async fn transaction_sees_its_own_writes() {
    let (store, rid) = store_with_room("own_writes.wal").await;
    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    tx.lock_room_for_update(rid).await.unwrap();
    let span = Span::new(BASE, BASE + H);
    assert!(!tx.find_overlapping_approved(rid, span, None).await.unwrap());

    let b = tx
        .insert_booking(new_booking(rid, BASE, BASE + H), BookingStatus::Approved)
        .await
        .unwrap();
    assert!(tx.find_overlapping_approved(rid, span, None).await.unwrap());
    assert!(!tx.find_overlapping_approved(rid, span, Some(b.id)).await.unwrap());

    // uncommitted rows are not in the committed index
    assert!(store.booking(b.id).await.is_none());
    tx.commit().await.unwrap();
    assert!(store.booking(b.id).await.is_some());
}

#[tokio::test]
async fn read_committed_read_ignores_other_statuses() {
    let (store, rid) = store_with_room("rc_read.wal").await;
    insert_committed(&store, rid, BASE, BASE + H, BookingStatus::Pending).await;
    insert_committed(&store, rid, BASE, BASE + H, BookingStatus::Rejected).await;

    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    let span = Span::new(BASE, BASE + H);
    assert!(!tx.find_overlapping_approved(rid, span, None).await.unwrap());
}

#[tokio::test]
async fn room_lock_blocks_second_transaction_until_deadline() {
    let (store, rid) = store_with_room("lock_blocks.wal").await;
    let mut holder = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    holder.lock_room_for_update(rid).await.unwrap();

    let short = Instant::now() + Duration::from_millis(50);
    let mut waiter = store.begin(Isolation::ReadCommitted, short).await.unwrap();
    let res = waiter.lock_room_for_update(rid).await;
    assert!(matches!(res, Err(StoreError::DeadlineExceeded)));

    holder.rollback();
    let mut next = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    assert_ok!(next.lock_room_for_update(rid).await);
}

#[tokio::test]
async fn serializable_read_takes_the_lock() {
    let (store, rid) = store_with_room("serializable.wal").await;
    let mut reader = store.begin(Isolation::Serializable, soon()).await.unwrap();
    reader
        .find_overlapping_approved(rid, Span::new(BASE, BASE + H), None)
        .await
        .unwrap();

    let short = Instant::now() + Duration::from_millis(50);
    let mut writer = store.begin(Isolation::ReadCommitted, short).await.unwrap();
    assert_err!(writer.lock_room_for_update(rid).await);
}

#[tokio::test]
async fn expired_deadline_at_commit_rolls_back() {
    let (store, rid) = store_with_room("deadline_commit.wal").await;
    let deadline = Instant::now() + Duration::from_millis(20);
    let mut tx = store.begin(Isolation::ReadCommitted, deadline).await.unwrap();
    let b = tx
        .insert_booking(new_booking(rid, BASE, BASE + H), BookingStatus::Approved)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(matches!(tx.commit().await, Err(StoreError::DeadlineExceeded)));
    assert!(store.booking(b.id).await.is_none());
    assert!(store.scan(soon()).await.unwrap()[0].bookings.is_empty());
}

#[tokio::test]
async fn abandoned_commit_lands_before_the_room_is_released() {
    let (store, rid) = store_with_room("abandoned_commit.wal").await;
    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    let b = tx
        .insert_booking(new_booking(rid, BASE, BASE + H), BookingStatus::Approved)
        .await
        .unwrap();
    // give up as soon as the record is queued for the writer
    let _ = tokio::time::timeout(Duration::ZERO, tx.commit()).await;
    drop(tx);

    let mut next = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    next.lock_room_for_update(rid).await.unwrap();
    assert!(next.find_overlapping_approved(rid, b.span, None).await.unwrap());
    next.rollback();
    assert_eq!(store.booking(b.id).await, Some(b));
}

#[tokio::test]
async fn unknown_room_is_an_error() {
    let (store, _) = store_with_room("unknown_room.wal").await;
    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    let missing = Ulid::new();
    assert!(matches!(
        tx.lock_room_for_update(missing).await,
        Err(StoreError::UnknownRoom(id)) if id == missing
    ));
    assert!(matches!(
        tx.insert_booking(new_booking(missing, BASE, BASE + H), BookingStatus::Approved).await,
        Err(StoreError::UnknownRoom(_))
    ));
}

#[tokio::test]
async fn conditional_update_checks_current_status() {
    let (store, rid) = store_with_room("conditional_update.wal").await;
    let b = insert_committed(&store, rid, BASE, BASE + H, BookingStatus::Approved).await;

    let rows = store
        .update_status_if(b.id, BookingStatus::Pending, BookingStatus::Rejected, soon())
        .await
        .unwrap();
    assert_eq!(rows, 0);
    assert_eq!(store.booking(b.id).await.unwrap().status, BookingStatus::Approved);

    let rows = store
        .update_status_if(Ulid::new(), BookingStatus::Pending, BookingStatus::Rejected, soon())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let rows = store
        .update_status_if(b.id, BookingStatus::Approved, BookingStatus::Rejected, soon())
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(store.booking(b.id).await.unwrap().status, BookingStatus::Rejected);
}

#[tokio::test]
async fn reject_overlapping_touches_only_overlapping_approved() {
    let (store, rid) = store_with_room("reject_overlapping.wal").await;
    let hit = insert_committed(&store, rid, BASE, BASE + H, BookingStatus::Approved).await;
    let touching = insert_committed(&store, rid, BASE + 2 * H, BASE + 3 * H, BookingStatus::Approved).await;
    let pending = insert_committed(&store, rid, BASE, BASE + H, BookingStatus::Pending).await;
    let target = insert_committed(&store, rid, BASE + H / 2, BASE + 2 * H, BookingStatus::Approved).await;

    let mut tx = store.begin(Isolation::ReadCommitted, soon()).await.unwrap();
    let rejected = tx
        .reject_overlapping(rid, target.span, target.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(rejected, vec![hit.id]);
    assert_eq!(store.booking(hit.id).await.unwrap().status, BookingStatus::Rejected);
    assert_eq!(store.booking(touching.id).await.unwrap().status, BookingStatus::Approved);
    assert_eq!(store.booking(pending.id).await.unwrap().status, BookingStatus::Pending);
    assert_eq!(store.booking(target.id).await.unwrap().status, BookingStatus::Approved);
}

#[tokio::test]
async fn commits_after_a_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_then_commit.wal");
    let room = {
        let store = Store::open(&path).unwrap();
        store
            .register_room("Annex".into(), 4, RoomKind::Shared, RoomStatus::Online)
            .await
            .unwrap()
    };
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[40u8, 0, 0, 0, 1, 2, 3]).unwrap(); // crash mid-record
    }

    let store = Store::open(&path).unwrap();
    let b = insert_committed(&store, room.id, BASE, BASE + H, BookingStatus::Approved).await;
    assert!(store.booking(b.id).await.is_some());
    drop(store);

    let reopened = Store::open(&path).unwrap();
    assert_eq!(reopened.room(room.id).await, Some(room));
    assert_eq!(reopened.booking(b.id).await, Some(b));
}

#[tokio::test]
async fn status_changes_survive_replay() {
    let path = test_wal_path("status_replay.wal");
    let store = Store::open(&path).unwrap();
    let room = store
        .register_room("Studio".into(), 3, RoomKind::Shared, RoomStatus::Online)
        .await
        .unwrap();
    let b = insert_committed(&store, room.id, BASE, BASE + H, BookingStatus::Pending).await;
    store
        .update_status_if(b.id, BookingStatus::Pending, BookingStatus::Approved, soon())
        .await
        .unwrap();
    drop(store);

    let reopened = Store::open(&path).unwrap();
    assert_eq!(reopened.booking(b.id).await.unwrap().status, BookingStatus::Approved);
}

#[tokio::test]
async fn reset_clears_bookings_and_persists() {
    let path = test_wal_path("reset.wal");
    let store = Store::open(&path).unwrap();
    let room = store
        .register_room("Hall".into(), 50, RoomKind::Shared, RoomStatus::Online)
        .await
        .unwrap();
    let b1 = insert_committed(&store, room.id, BASE, BASE + H, BookingStatus::Approved).await;
    insert_committed(&store, room.id, BASE, BASE + H, BookingStatus::Rejected).await;

    assert_eq!(store.reset_bookings().await.unwrap(), 2);
    assert!(store.booking(b1.id).await.is_none());
    let after = insert_committed(&store, room.id, BASE, BASE + H, BookingStatus::Approved).await;
    drop(store);

    let reopened = Store::open(&path).unwrap();
    assert_eq!(reopened.room_count(), 1);
    let rooms = reopened.scan(soon()).await.unwrap();
    assert_eq!(rooms[0].bookings, vec![after]);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let store = Store::open(&path).unwrap();
    let room = store
        .register_room("Lab".into(), 2, RoomKind::Exclusive, RoomStatus::Online)
        .await
        .unwrap();
    let b = insert_committed(&store, room.id, BASE, BASE + H, BookingStatus::Pending).await;
    for _ in 0..4 {
        store
            .update_status_if(b.id, BookingStatus::Pending, BookingStatus::Pending, soon())
            .await
            .unwrap();
    }
    store
        .update_status_if(b.id, BookingStatus::Pending, BookingStatus::Approved, soon())
        .await
        .unwrap();
    let before = store.scan(soon()).await.unwrap();

    store.compact().await.unwrap();
    assert_eq!(store.wal_appends_since_compact().await, 0);
    assert_eq!(Wal::replay(&path).unwrap().len(), 2);
    drop(store);

    let reopened = Store::open(&path).unwrap();
    let after = reopened.scan(soon()).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].room, before[0].room);
    assert_eq!(after[0].bookings, before[0].bookings);
}
