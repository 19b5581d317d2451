use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use taxguard_core::ActorKind;
use taxguard_lifecycle::{
    check_all_tables, EngagementMachine, EngagementStatus, FormData, RequirementTable,
    StateMachine,
};

fn bench_transition_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition_lookup");

    group.bench_function("legal_edge", |b| {
        b.iter(|| {
            EngagementMachine::attempt(
                black_box(EngagementStatus::AwaitingApproval),
                black_box(EngagementStatus::Filed),
                black_box(ActorKind::EndUser),
            )
        })
    });

    group.bench_function("absent_edge", |b| {
        b.iter(|| {
            EngagementMachine::attempt(
                black_box(EngagementStatus::Created),
                black_box(EngagementStatus::Completed),
                black_box(ActorKind::Staff),
            )
        })
    });

    group.bench_function("all_pairs_all_actors", |b| {
        b.iter(|| {
            let mut allowed = 0usize;
            for from in EngagementStatus::ALL {
                for to in EngagementStatus::ALL {
                    for actor in [ActorKind::EndUser, ActorKind::Staff, ActorKind::System] {
                        if EngagementMachine::attempt(from, to, actor).is_ok() {
                            allowed += 1;
                        }
                    }
                }
            }
            black_box(allowed)
        })
    });

    group.finish();
}

fn bench_requirement_table(c: &mut Criterion) {
    let table = RequirementTable::standard();
    let mut data = FormData::default();
    for rule in table.rules() {
        data.flags.insert(rule.flag.clone(), true);
        data.sections
            .insert(rule.section.clone(), json!([{ "amount": 1200 }]));
    }

    c.bench_function("requirement_table_validate", |b| {
        b.iter(|| table.validate(black_box(&data)))
    });
}

fn bench_consistency_check(c: &mut Criterion) {
    c.bench_function("check_all_tables", |b| b.iter(check_all_tables));
}

criterion_group!(
    benches,
    bench_transition_lookup,
    bench_requirement_table,
    bench_consistency_check
);
criterion_main!(benches);
