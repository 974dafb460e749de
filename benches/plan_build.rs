//! Plan building benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use tsql_planner::metastore::{AttributeMetadata, AttributeType};
use tsql_planner::{EntityMetadata, InMemoryMetadataCatalog, PlanBuilder, SessionSnapshot};

fn catalog() -> InMemoryMetadataCatalog {
    let account = EntityMetadata::new("account", "accountid")
        .with_attribute(AttributeMetadata::new("name", AttributeType::String))
        .with_attribute(AttributeMetadata::new("revenue", AttributeType::Money))
        .with_attribute(AttributeMetadata::new("primarycontactid", AttributeType::Lookup))
        .with_attribute(AttributeMetadata::new("parentaccountid", AttributeType::Lookup))
        .with_estimated_rows(5_000);
    let contact = EntityMetadata::new("contact", "contactid")
        .with_attribute(AttributeMetadata::new("fullname", AttributeType::String))
        .with_attribute(AttributeMetadata::new("department", AttributeType::String))
        .with_attribute(AttributeMetadata::new("annualincome", AttributeType::Money))
        .with_attribute(AttributeMetadata::new("parentcustomerid", AttributeType::Customer))
        .with_estimated_rows(20_000);
    InMemoryMetadataCatalog::new()
        .with_entity(account)
        .with_entity(contact)
}

const QUERIES: &[(&str, &str)] = &[
    (
        "merge_join",
        "SELECT a.name, c.fullname FROM account a JOIN contact c ON a.primarycontactid = c.contactid",
    ),
    (
        "correlated_exists",
        "SELECT a.name FROM account a \
         WHERE EXISTS (SELECT * FROM contact c WHERE c.parentcustomerid = a.accountid)",
    ),
    (
        "window",
        "SELECT fullname, ROW_NUMBER() OVER (PARTITION BY department ORDER BY annualincome DESC) \
         FROM contact",
    ),
    (
        "recursive_cte",
        "WITH chain AS ( \
         SELECT accountid, name FROM account WHERE parentaccountid IS NULL \
         UNION ALL \
         SELECT a.accountid, a.name FROM account a JOIN chain c ON a.parentaccountid = c.accountid \
         ) SELECT name FROM chain OPTION (MAXRECURSION 10)",
    ),
    (
        "script",
        "DECLARE @x INT = 0; WHILE @x < 10 BEGIN SET @x = @x + 1; IF @x = 5 BREAK; END",
    ),
];

fn benchmark_build(c: &mut Criterion) {
    let catalog = catalog();
    let session = SessionSnapshot::new();
    let parameters = HashMap::new();

    let mut group = c.benchmark_group("plan_build");
    for (name, sql) in QUERIES {
        group.bench_with_input(BenchmarkId::new("build", name), sql, |b, sql| {
            b.iter(|| {
                let roots = PlanBuilder::new(&catalog, &session)
                    .build(sql, &parameters)
                    .unwrap();
                black_box(roots.len());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_build);
criterion_main!(benches);
