//! Record building and the year-by-year record stream.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;

use fts_core::{
    as_entity, optional_text, required_text, AppealIdentity, AppealRecord, ClusterRecord,
    CollectionLevel, DataMode, EmergencyRecord, FundingRecord, RawEntity, RecordBase,
    RequirementInfo, ShapeError, REQUIREMENT_KEYS,
};
use fts_storage::FetchError;
use fts_source::{resolve_countries, CountryLookup, FundingSource, ItemStream};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::SyncError;

/// Flat records in emission order: ascending year, then upstream listing
/// order, then upstream cluster order.
pub type RecordStream = BoxStream<'static, Result<FundingRecord, SyncError>>;

/// Emergency name recorded for appeals whose emergency is not listed for
/// the same year.
pub const UNKNOWN_EMERGENCY: &str = "N/A";

/// Half-open window of upstream years, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl YearRange {
    pub fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    /// `end` defaults to the year after `current_year`, `start` to the year
    /// before `end`.
    pub fn resolve(start: Option<i32>, end: Option<i32>, current_year: i32) -> Self {
        let end = end.unwrap_or(current_year + 1);
        let start = start.unwrap_or(end - 1);
        Self { start, end }
    }

    pub fn years(&self) -> Range<i32> {
        self.start..self.end
    }
}

/// Per-year state the builder needs besides the item itself.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub year: i32,
    pub emergency_titles: &'a HashMap<String, String>,
}

fn shape_error(mode: DataMode, entity: impl Into<String>) -> impl FnOnce(ShapeError) -> SyncError {
    let entity = entity.into();
    move |source| SyncError::Shape {
        mode,
        entity,
        source,
    }
}

fn item_label(raw: &RawEntity) -> String {
    optional_text(raw, "id")
        .ok()
        .flatten()
        .unwrap_or_else(|| "<no id>".to_string())
}

fn requirement_for(
    mode: DataMode,
    raw: &RawEntity,
    entity: &str,
) -> Result<RequirementInfo, SyncError> {
    let info = RequirementInfo::compute(raw).map_err(shape_error(mode, entity))?;
    if info.requirement().is_none()
        && REQUIREMENT_KEYS
            .iter()
            .any(|key| matches!(raw.get(*key), Some(JsonValue::Null)))
    {
        warn!(%mode, entity, "requirement is null upstream; recording funding only");
    }
    Ok(info)
}

fn cluster_name(raw: &RawEntity) -> Result<String, ShapeError> {
    match optional_text(raw, "cluster")? {
        Some(name) => Ok(name),
        None => optional_text(raw, "name")?.ok_or(ShapeError::Missing { field: "cluster" }),
    }
}

fn year_of(raw: &RawEntity, ctx: &BuildContext<'_>) -> Result<String, ShapeError> {
    Ok(optional_text(raw, "year")?.unwrap_or_else(|| ctx.year.to_string()))
}

/// Turns one upstream item into flat records. Emergency and appeal items
/// yield exactly one record; cluster mode yields one per cluster listed for
/// the appeal, which may be none.
pub async fn build_records(
    source: &dyn FundingSource,
    mode: DataMode,
    item: &JsonValue,
    ctx: &BuildContext<'_>,
) -> Result<Vec<FundingRecord>, SyncError> {
    let raw = as_entity(item).map_err(shape_error(mode, "item"))?;
    let label = item_label(raw);

    match mode {
        DataMode::Emergency => {
            let base = emergency_base(source, raw, ctx)
                .await
                .map_err(|err| err.in_entity(mode, &label))?;
            let requirement = requirement_for(mode, raw, &label)?;
            Ok(vec![FundingRecord::Emergency(EmergencyRecord { base, requirement })])
        }
        DataMode::Appeal => {
            let (base, appeal) = appeal_base(source, raw, ctx)
                .await
                .map_err(|err| err.in_entity(mode, &label))?;
            let requirement = requirement_for(mode, raw, &label)?;
            Ok(vec![FundingRecord::Appeal(AppealRecord {
                base,
                appeal,
                requirement,
            })])
        }
        DataMode::Cluster => {
            let (base, appeal) = appeal_base(source, raw, ctx)
                .await
                .map_err(|err| err.in_entity(mode, &label))?;
            let clusters = source.fetch_clusters(&appeal.appeal_id).await?;
            debug!(appeal_id = %appeal.appeal_id, clusters = clusters.len(), "fetched clusters");

            let mut records = Vec::with_capacity(clusters.len());
            for (index, cluster) in clusters.iter().enumerate() {
                let entity = format!("{label} cluster #{index}");
                let raw_cluster = as_entity(cluster).map_err(shape_error(mode, entity.as_str()))?;
                let name = cluster_name(raw_cluster).map_err(shape_error(mode, entity.as_str()))?;
                let requirement = requirement_for(mode, raw_cluster, &entity)?;
                records.push(FundingRecord::Cluster(ClusterRecord {
                    base: base.clone(),
                    appeal: appeal.clone(),
                    cluster: name,
                    requirement,
                }));
            }
            Ok(records)
        }
    }
}

/// Shape or fetch failure raised before the caller knows the entity label.
enum BaseError {
    Shape(ShapeError),
    Fetch(FetchError),
}

impl From<ShapeError> for BaseError {
    fn from(err: ShapeError) -> Self {
        BaseError::Shape(err)
    }
}

impl From<FetchError> for BaseError {
    fn from(err: FetchError) -> Self {
        BaseError::Fetch(err)
    }
}

impl BaseError {
    fn in_entity(self, mode: DataMode, entity: &str) -> SyncError {
        match self {
            BaseError::Shape(source) => SyncError::Shape {
                mode,
                entity: entity.to_string(),
                source,
            },
            BaseError::Fetch(err) => SyncError::Fetch(err),
        }
    }
}

async fn emergency_base(
    source: &dyn FundingSource,
    raw: &RawEntity,
    ctx: &BuildContext<'_>,
) -> Result<RecordBase, BaseError> {
    let emergency_id = required_text(raw, "id")?;
    let emergency_name = required_text(raw, "title")?;
    let country = optional_text(raw, "country")?;
    let year = year_of(raw, ctx)?;
    let countries = resolve_countries(
        source,
        country.as_deref(),
        &CountryLookup::Emergency(emergency_id.clone()),
    )
    .await?;

    Ok(RecordBase {
        emergency_id,
        emergency_name,
        countries,
        year,
    })
}

async fn appeal_base(
    source: &dyn FundingSource,
    raw: &RawEntity,
    ctx: &BuildContext<'_>,
) -> Result<(RecordBase, AppealIdentity), BaseError> {
    let appeal_id = required_text(raw, "id")?;
    let appeal_name = required_text(raw, "title")?;
    let emergency_id = required_text(raw, "emergency_id")?;
    let funding_type = optional_text(raw, "type")?.unwrap_or_default();
    let country = optional_text(raw, "country")?;
    let year = year_of(raw, ctx)?;

    let emergency_name = match ctx.emergency_titles.get(&emergency_id) {
        Some(title) => title.clone(),
        None => {
            warn!(
                %appeal_id,
                %emergency_id,
                year = ctx.year,
                "appeal references an unknown emergency"
            );
            UNKNOWN_EMERGENCY.to_string()
        }
    };
    let countries = resolve_countries(
        source,
        country.as_deref(),
        &CountryLookup::Appeal(appeal_id.clone()),
    )
    .await?;

    Ok((
        RecordBase {
            emergency_id,
            emergency_name,
            countries,
            year,
        },
        AppealIdentity {
            appeal_id,
            appeal_name,
            funding_type,
        },
    ))
}

/// Drains one year's emergency collection into an id -> title lookup.
pub async fn load_emergency_titles(
    source: &dyn FundingSource,
    year: i32,
) -> Result<HashMap<String, String>, SyncError> {
    let mut items = source.fetch_year(CollectionLevel::Emergency, year).await?;
    let mut titles = HashMap::new();
    while let Some(item) = items.next().await {
        let item = item?;
        let raw = as_entity(&item).map_err(shape_error(DataMode::Emergency, "item"))?;
        let label = item_label(raw);
        let id =
            required_text(raw, "id").map_err(shape_error(DataMode::Emergency, label.as_str()))?;
        let title = optional_text(raw, "title")
            .map_err(shape_error(DataMode::Emergency, label.as_str()))?
            .unwrap_or_default();
        titles.insert(id, title);
    }
    debug!(year, emergencies = titles.len(), "loaded emergency titles");
    Ok(titles)
}

struct YearCursor {
    year: i32,
    titles: HashMap<String, String>,
    items: ItemStream,
}

struct GenerateState {
    source: Arc<dyn FundingSource>,
    mode: DataMode,
    years: Range<i32>,
    cursor: Option<YearCursor>,
    pending: VecDeque<FundingRecord>,
    done: bool,
}

impl GenerateState {
    async fn open_year(
        source: &dyn FundingSource,
        mode: DataMode,
        year: i32,
    ) -> Result<YearCursor, SyncError> {
        let titles = match mode {
            DataMode::Emergency => HashMap::new(),
            DataMode::Appeal | DataMode::Cluster => load_emergency_titles(source, year).await?,
        };
        info!(mode = %mode, year, "streaming year collection");
        let items = source.fetch_year(mode.collection_level(), year).await?;
        Ok(YearCursor { year, titles, items })
    }

    /// Makes one unit of progress: opens the next year, builds records for
    /// one item, or closes an exhausted year. Returns `false` once every year
    /// has been read.
    async fn advance(&mut self) -> Result<bool, SyncError> {
        let Some(cursor) = self.cursor.as_mut() else {
            let Some(year) = self.years.next() else {
                return Ok(false);
            };
            let cursor = Self::open_year(self.source.as_ref(), self.mode, year).await?;
            self.cursor = Some(cursor);
            return Ok(true);
        };

        match cursor.items.next().await {
            Some(item) => {
                let item = item?;
                let ctx = BuildContext {
                    year: cursor.year,
                    emergency_titles: &cursor.titles,
                };
                let records = build_records(self.source.as_ref(), self.mode, &item, &ctx).await?;
                self.pending.extend(records);
            }
            None => self.cursor = None,
        }
        Ok(true)
    }
}

/// Lazily produces every record of `mode` across `years`. Nothing is fetched
/// until the stream is polled, and an item's cluster listing is requested
/// only after every record of the previous item has been taken. The first
/// error ends the stream.
pub fn generate(source: Arc<dyn FundingSource>, mode: DataMode, years: YearRange) -> RecordStream {
    let state = GenerateState {
        source,
        mode,
        years: years.years(),
        cursor: None,
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(record) = st.pending.pop_front() {
                return Some((Ok(record), st));
            }
            if st.done {
                return None;
            }
            match st.advance().await {
                Ok(true) => {}
                Ok(false) => {
                    st.done = true;
                    return None;
                }
                Err(err) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
            }
        }
    })
    .boxed()
}
