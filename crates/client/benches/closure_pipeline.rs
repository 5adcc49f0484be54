use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::Utc;
use fieldops_client::geofence;
use fieldops_client::images::{self, ImageFile};
use fieldops_client::testing::{FakeBackend, RecordingNotifier};
use fieldops_client::{
    ClosurePayload, ImageUploader, InMemoryOutbox, OutboxStore, SyncEngine,
};
use fieldops_core::{PartId, TicketId};
use fieldops_tickets::{FormData, SelectedPart, Ticket, TicketStatus};
use serde_json::json;

fn bench_distance(c: &mut Criterion) {
    c.bench_function("haversine_distance", |b| {
        b.iter(|| {
            geofence::distance(
                black_box(41.0082),
                black_box(28.9784),
                black_box(41.0105),
                black_box(28.9802),
            )
        })
    });
}

fn bench_inline_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("inline_image");
    for size in [16 * 1024, 256 * 1024, 1024 * 1024] {
        let file = ImageFile::new("photo.jpg", "image/jpeg", vec![0x5A; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("round_trip", size), &file, |b, file| {
            b.iter(|| images::from_base64(&images::to_base64(black_box(file))))
        });
    }
    group.finish();
}

fn payload(with_photo: bool) -> ClosurePayload {
    let mut answers = FormData::new();
    answers.insert("notes".into(), json!("serviced"));
    if with_photo {
        let photo = ImageFile::new("after.jpg", "image/jpeg", vec![0x11; 32 * 1024]);
        answers.insert("photo_after".into(), json!(images::to_base64(&photo)));
    }
    ClosurePayload {
        selected_parts: (0..3)
            .map(|i| SelectedPart::new(PartId::new(), i + 1, 12.5).expect("valid part"))
            .collect(),
        form_answers: answers,
        closed_at: Utc::now(),
        repair_cost: 75.0,
        repair_duration: Some(40),
        technician_id: None,
        labor_cost: 20.0,
        expense: None,
    }
}

fn bench_drain(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("drain_pass");
    for items in [10usize, 100] {
        for with_photo in [false, true] {
            let id = format!("{items}_items{}", if with_photo { "_photo" } else { "" });
            group.throughput(Throughput::Elements(items as u64));
            group.bench_function(BenchmarkId::new("in_memory", id), |b| {
                b.iter(|| {
                    runtime.block_on(async {
                        let backend = Arc::new(FakeBackend::new());
                        let outbox = InMemoryOutbox::arc();
                        for _ in 0..items {
                            let ticket = Ticket::new(TicketId::new())
                                .with_status(TicketStatus::InProgress);
                            backend.insert_ticket(ticket.clone());
                            outbox
                                .put(ticket.id, payload(with_photo))
                                .await
                                .expect("put");
                        }
                        let engine = SyncEngine::new(
                            backend.clone(),
                            ImageUploader::new(backend),
                            outbox,
                            Arc::new(RecordingNotifier::new()),
                        );
                        black_box(engine.drain().await.expect("drain"))
                    })
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_distance, bench_inline_encoding, bench_drain);
criterion_main!(benches);
