use std::collections::HashMap;
use std::sync::Arc;

use fts_core::{CollectionLevel, DataMode, FundingRecord};
use fts_source::{CountryLookup, FixtureSource, Resource};
use fts_storage::{MemoryStore, RecordStore};
use fts_sync::{
    current_year, generate, ConfigProfile, SyncConfig, SyncError, SyncPipeline, SyncStrategy,
    YearRange,
};
use futures::StreamExt;
use serde_json::{json, Value as JsonValue};

fn config(pairs: &[(&str, &str)]) -> SyncConfig {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    SyncConfig::from_vars(ConfigProfile::Production, |key| vars.get(key).cloned())
}

fn year(level: CollectionLevel, year: i32) -> Resource {
    Resource::Year { level, year }
}

/// One emergency `E1` ("Flood") with appeals `A1` (two clusters) and `A2`
/// (no clusters) in `year`.
fn flood_fixtures(year_no: i32) -> FixtureSource {
    FixtureSource::new("item")
        .with_slice_len(5)
        .with_document(
            year(CollectionLevel::Emergency, year_no),
            &json!([{"id": "E1", "title": "Flood", "country": "Kenya", "funding": 80}]),
        )
        .with_document(
            year(CollectionLevel::Appeal, year_no),
            &json!([
                {"id": "A1", "title": "Flood response", "emergency_id": "E1", "type": "CAP",
                 "country": "Region", "funding": 50, "current_requirement": 100},
                {"id": "A2", "title": "Flood recovery", "emergency_id": "E1",
                 "country": "Kenya", "funding": 30}
            ]),
        )
        .with_document(
            CountryLookup::Appeal("A1".into()).resource(),
            &json!([{"country": "Somalia"}, {"country": "Kenya"}, {"country": "none"}]),
        )
        .with_document(
            Resource::Clusters("A1".into()),
            &json!([
                {"cluster": "HEALTH", "funding": 20, "current_requirements": 40},
                {"name": "SHELTER", "funding": 30, "current_requirement": 60}
            ]),
        )
        .with_document(Resource::Clusters("A2".into()), &json!([]))
}

fn flat(record: &FundingRecord) -> serde_json::Map<String, JsonValue> {
    record.to_flat().fields
}

#[tokio::test]
async fn appeal_backfill_joins_emergency_title_and_computes_coverage() {
    let source = Arc::new(flood_fixtures(2015));
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(config(&[]), source.clone(), store.clone());

    let summary = pipeline
        .backfill(DataMode::Appeal, YearRange::new(2015, 2016))
        .await
        .expect("backfill");
    assert_eq!(summary.strategy, SyncStrategy::Backfill);
    assert_eq!(summary.inserted, 2);
    assert!(!summary.capped);

    let rows = store.rows(DataMode::Appeal).await;
    assert_eq!(rows.len(), 2);
    let a1 = flat(&rows[0].record);
    assert_eq!(a1["appeal_id"], json!("A1"));
    assert_eq!(a1["emergency_name"], json!("Flood"));
    assert_eq!(a1["requirement"], json!(100.0));
    assert_eq!(a1["funding"], json!(50.0));
    assert_eq!(a1["coverage"], json!(0.5));
    assert_eq!(a1["countries"], json!("\"Kenya\",\"Somalia\""));

    let a2 = flat(&rows[1].record);
    assert_eq!(a2["funding_type"], json!(""));
    assert!(!a2.contains_key("requirement"));
    assert!(!a2.contains_key("coverage"));

    assert_eq!(
        source.requests(),
        vec![
            "emergency/year/2015".to_string(),
            "appeal/year/2015".to_string(),
            "project/appeal/A1".to_string(),
        ]
    );
}

#[tokio::test]
async fn cluster_backfill_skips_appeals_without_clusters() {
    let source = Arc::new(flood_fixtures(2015));
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(config(&[]), source, store.clone());

    let summary = pipeline
        .backfill(DataMode::Cluster, YearRange::new(2015, 2016))
        .await
        .expect("backfill");
    assert_eq!(summary.inserted, 2);

    let rows = store.rows(DataMode::Cluster).await;
    let clusters: Vec<_> = rows.iter().filter_map(|row| row.record.cluster()).collect();
    assert_eq!(clusters, vec!["HEALTH", "SHELTER"]);
    for row in &rows {
        let fields = flat(&row.record);
        assert_eq!(fields["appeal_id"], json!("A1"));
        assert_eq!(fields["emergency_name"], json!("Flood"));
        assert_eq!(fields["coverage"], json!(0.5));
    }
    assert_eq!(flat(&rows[0].record)["funding"], json!(20.0));
    assert_eq!(flat(&rows[1].record)["requirement"], json!(60.0));
}

#[tokio::test]
async fn cluster_listings_are_fetched_only_when_needed() {
    let source = Arc::new(flood_fixtures(2015));
    let mut records = generate(source.clone(), DataMode::Cluster, YearRange::new(2015, 2016));
    assert_eq!(source.request_count(), 0);

    let first = records.next().await.expect("record").expect("ok");
    assert_eq!(first.cluster(), Some("HEALTH"));
    let requested = source.requests();
    assert!(requested.contains(&"cluster/appeal/A1".to_string()));
    assert!(!requested.contains(&"cluster/appeal/A2".to_string()));

    let second = records.next().await.expect("record").expect("ok");
    assert_eq!(second.cluster(), Some("SHELTER"));
    assert!(!source.requests().contains(&"cluster/appeal/A2".to_string()));

    assert!(records.next().await.is_none());
    assert!(source.requests().contains(&"cluster/appeal/A2".to_string()));
}

#[tokio::test]
async fn populate_twice_converges_on_the_same_rows() {
    let this_year = current_year();
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(
        config(&[]),
        Arc::new(flood_fixtures(this_year)),
        store.clone(),
    );

    let first = pipeline.populate_all().await.expect("first populate");
    let mut snapshot = HashMap::new();
    for mode in DataMode::ALL {
        let records: Vec<_> = store.rows(mode).await.into_iter().map(|row| row.record).collect();
        snapshot.insert(mode, records);
    }

    let second = pipeline.populate_all().await.expect("second populate");
    for mode in DataMode::ALL {
        let records: Vec<_> = store.rows(mode).await.into_iter().map(|row| row.record).collect();
        assert_eq!(records, snapshot[&mode], "{mode} rows changed");
    }

    let inserted: Vec<u64> = first.iter().map(|s| s.inserted).collect();
    assert_eq!(inserted, vec![1, 2, 2]);
    let deleted: Vec<u64> = second.iter().map(|s| s.deleted).collect();
    assert_eq!(deleted, vec![1, 2, 2]);
    assert!(first.iter().all(|s| s.start_year == this_year && s.end_year == this_year + 1));
}

#[tokio::test]
async fn populate_keeps_clusters_split_across_chunks() {
    let this_year = current_year();
    let source = FixtureSource::new("item")
        .with_document(
            year(CollectionLevel::Emergency, this_year),
            &json!([{"id": "E1", "title": "Flood"}]),
        )
        .with_document(
            year(CollectionLevel::Appeal, this_year),
            &json!([{"id": "A1", "title": "Flood response", "emergency_id": "E1",
                     "country": "Kenya", "funding": 1}]),
        )
        .with_document(
            Resource::Clusters("A1".into()),
            &json!([
                {"cluster": "HEALTH", "funding": 1},
                {"cluster": "SHELTER", "funding": 2},
                {"cluster": "WASH", "funding": 3}
            ]),
        );
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(
        config(&[("CHUNK_SIZE", "2")]),
        Arc::new(source),
        store.clone(),
    );

    for _ in 0..2 {
        let summary = pipeline.populate(DataMode::Cluster).await.expect("populate");
        assert_eq!(summary.chunks, 2);
        assert_eq!(store.count(DataMode::Cluster).await.expect("count"), 3);
    }
    let clusters: Vec<_> = store
        .rows(DataMode::Cluster)
        .await
        .iter()
        .filter_map(|row| row.record.cluster().map(str::to_string))
        .collect();
    assert_eq!(clusters, vec!["HEALTH", "SHELTER", "WASH"]);
}

#[tokio::test]
async fn row_cap_is_checked_between_chunks() {
    let emergencies: Vec<JsonValue> = (0..9)
        .map(|i| json!({"id": format!("E{i}"), "title": "Storm", "country": "Fiji", "funding": i}))
        .collect();
    let source = Arc::new(FixtureSource::new("item").with_document(
        year(CollectionLevel::Emergency, 2015),
        &JsonValue::Array(emergencies),
    ));
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(
        config(&[("CHUNK_SIZE", "2"), ("ROW_LIMIT", "5")]),
        source,
        store.clone(),
    );

    let summary = pipeline
        .backfill(DataMode::Emergency, YearRange::new(2015, 2016))
        .await
        .expect("backfill");
    assert_eq!(summary.inserted, 6);
    assert!(summary.capped);
    assert_eq!(store.count(DataMode::Emergency).await.expect("count"), 6);
}

#[tokio::test]
async fn backfill_spans_years_and_stops_at_the_first_failure() {
    let source = Arc::new(
        FixtureSource::new("item")
            .with_document(
                year(CollectionLevel::Emergency, 2014),
                &json!([
                    {"id": "E0", "title": "Storm", "country": "Fiji", "funding": 1},
                    {"id": "E1", "title": "Flood", "country": "Kenya", "funding": 2}
                ]),
            )
            .with_raw(
                year(CollectionLevel::Emergency, 2015),
                r#"[{"id": "E2", "title": "Quake", "country": "Nepal", "funding": 3}, {"id": "#,
            ),
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = SyncPipeline::new(config(&[("CHUNK_SIZE", "2")]), source, store.clone());

    let err = pipeline
        .backfill(DataMode::Emergency, YearRange::new(2014, 2016))
        .await
        .expect_err("truncated 2015 collection");
    assert!(matches!(err, SyncError::Fetch(_)));

    let years: Vec<_> = store
        .rows(DataMode::Emergency)
        .await
        .iter()
        .map(|row| row.record.base().year.clone())
        .collect();
    assert_eq!(years, vec!["2014", "2014"]);
}
