use codepair_collab::broadcast::SessionChannel;
use codepair_collab::model::{
    color_for, ChatMessage, CursorPosition, NewSession, Participant, Permission, UserProfile,
};
use codepair_collab::presence::PresenceTracker;
use codepair_collab::protocol::{CodeUpdate, Frame, FrameBody};
use codepair_collab::storage::{MemoryStore, RocksStore, SessionStore, StoreConfig};
use codepair_collab::OfflineQueue;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tokio::sync::mpsc;
use uuid::Uuid;

fn code_frame(bytes: usize) -> Frame {
    Frame::new(FrameBody::CodeUpdated(CodeUpdate {
        code: "x".repeat(bytes),
    }))
    .from_user("alice")
    .in_session(Uuid::new_v4())
}

fn bench_code_frame_encode(c: &mut Criterion) {
    let frame = code_frame(1024);

    c.bench_function("code_frame_encode_1KB", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_code_frame_decode(c: &mut Criterion) {
    let encoded = code_frame(1024).encode().unwrap();

    c.bench_function("code_frame_decode_1KB", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_cursor_roundtrip(c: &mut Criterion) {
    c.bench_function("cursor_frame_roundtrip", |b| {
        b.iter(|| {
            let frame = Frame::new(FrameBody::CursorUpdated(CursorPosition::new(
                black_box(120),
                black_box(17),
            )))
            .from_user("bob");
            let encoded = frame.encode().unwrap();
            black_box(Frame::decode(&encoded).unwrap());
        })
    });
}

fn bench_color_for(c: &mut Criterion) {
    c.bench_function("color_for_user", |b| {
        b.iter(|| black_box(color_for(black_box("user-1234567890"))))
    });
}

fn bench_broadcast_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let frame = code_frame(256);

    c.bench_function("broadcast_1000_frames_100_conns", |b| {
        b.iter(|| {
            rt.block_on(async {
                let channel = SessionChannel::new(Uuid::new_v4());
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let (tx, rx) = mpsc::channel(2048);
                    channel.subscribe(Uuid::new_v4(), format!("user{i}"), tx).await;
                    receivers.push(rx);
                }

                for _ in 0..1000 {
                    channel.broadcast(black_box(&frame), None).await.unwrap();
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000 {
                let body = if i % 2 == 0 {
                    FrameBody::CodeUpdated(CodeUpdate { code: format!("v{i}") })
                } else {
                    FrameBody::CursorUpdated(CursorPosition::new(i, 0))
                };
                queue.enqueue(black_box(body));
            }
            black_box(queue.drain());
        })
    });
}

fn bench_presence_set_cursor(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tracker = PresenceTracker::new();
    let session_id = Uuid::new_v4();
    rt.block_on(async {
        for i in 0..100 {
            let user = Participant::from_profile(
                &UserProfile::new(format!("user{i}"), format!("User {i}")),
                Permission::Edit,
            );
            tracker.register_user(session_id, user).await;
        }
    });

    c.bench_function("presence_set_cursor_100_users", |b| {
        let mut line = 0u32;
        b.iter(|| {
            line = line.wrapping_add(1);
            rt.block_on(async {
                black_box(
                    tracker
                        .set_cursor(session_id, "user42", CursorPosition::new(line, 3))
                        .await
                        .unwrap(),
                );
            });
        })
    });
}

fn bench_memory_update_code(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = MemoryStore::new();
    let session = rt
        .block_on(store.create_session("alice", NewSession::named("bench")))
        .unwrap();
    let code = "fn main() {}\n".repeat(64);

    c.bench_function("memory_update_code_832B", |b| {
        b.iter(|| {
            rt.block_on(store.update_code(session.id, black_box(code.clone())))
                .unwrap();
        })
    });
}

fn bench_rocks_update_code(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = std::env::temp_dir().join(format!("codepair_bench_update_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let session = rt
        .block_on(store.create_session("alice", NewSession::named("bench")))
        .unwrap();
    let code = "fn main() {}\n".repeat(64);

    c.bench_function("rocks_update_code_832B", |b| {
        b.iter(|| {
            rt.block_on(store.update_code(session.id, black_box(code.clone())))
                .unwrap();
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_append_message(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = std::env::temp_dir().join(format!("codepair_bench_chat_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let session = rt
        .block_on(store.create_session("alice", NewSession::named("bench")))
        .unwrap();
    let author = Participant::from_profile(&UserProfile::new("alice", "Alice"), Permission::Admin);

    c.bench_function("rocks_append_message_capped_200", |b| {
        b.iter(|| {
            let message = ChatMessage::text(&author, "ship it");
            rt.block_on(store.append_message(session.id, black_box(message), 200))
                .unwrap();
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_get_session(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = std::env::temp_dir().join(format!("codepair_bench_get_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let session = rt
        .block_on(store.create_session("alice", NewSession::named("bench")))
        .unwrap();
    rt.block_on(store.update_code(session.id, "let x = 1;\n".repeat(400)))
        .unwrap();

    c.bench_function("rocks_get_session_4KB", |b| {
        b.iter(|| black_box(rt.block_on(store.get_session(black_box(session.id))).unwrap()))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_code_frame_encode,
    bench_code_frame_decode,
    bench_cursor_roundtrip,
    bench_color_for,
    bench_broadcast_1000_frames,
    bench_offline_queue,
    bench_presence_set_cursor,
    bench_memory_update_code,
    bench_rocks_update_code,
    bench_rocks_append_message,
    bench_rocks_get_session,
);
criterion_main!(benches);
