//! Remote source contract for the Development.i filter-results API and the
//! paginator that drains it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use devapps_core::RawFeature;
use devapps_storage::{FetchError, HttpFetcher};
use futures::future::try_join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "devapps-source";

pub const DEFAULT_ENDPOINT: &str =
    "https://developmenti.brisbane.qld.gov.au/Geo/GetApplicationFilterResults";

pub const PAGE_SIZE: usize = 200;

pub const DEFAULT_WINDOW_DAYS: i64 = 14;

/// Closed polygon (lat, lng) covering the Brisbane local government area.
const BRISBANE_BOUNDARY: [(f64, f64); 5] = [
    (-27.925913196829814, 152.2546140028),
    (-27.925913196829814, 153.79558599720002),
    (-27.011590411641816, 153.79558599720002),
    (-27.011590411641816, 152.2546140028),
    (-27.925913196829814, 152.2546140028),
];

/// Submission-date window shared by every page of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QueryWindow {
    pub fn trailing(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: now - Duration::days(days),
            end: now,
        }
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ViewPort {
    pub boundary_type: String,
    pub geometry_property_name: String,
    pub boundary: Vec<Vec<LatLng>>,
}

impl ViewPort {
    pub fn brisbane() -> Self {
        Self {
            boundary_type: "POLYGON".to_string(),
            geometry_property_name: "geom_point".to_string(),
            boundary: vec![BRISBANE_BOUNDARY
                .iter()
                .map(|&(lat, lng)| LatLng { lat, lng })
                .collect()],
        }
    }
}

/// Body of one `GetApplicationFilterResults` request.
///
/// Lookup filters are always sent as explicit nulls; the API expects the keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationFilterRequest {
    pub progress: String,
    pub start_date_unix_epoch_number: i64,
    pub end_date_unix_epoch_number: i64,
    pub date_range_field: String,
    pub date_range_descriptor: String,
    pub lot_plan: Option<String>,
    pub land_number: Option<String>,
    pub prop_number: Option<String>,
    #[serde(rename = "DANumber")]
    pub da_number: Option<String>,
    #[serde(rename = "BANumber")]
    pub ba_number: Option<String>,
    pub plumb_number: Option<String>,
    #[serde(rename = "IncludeDA")]
    pub include_da: bool,
    #[serde(rename = "IncludeBA")]
    pub include_ba: bool,
    pub include_plumb: bool,
    pub locality_id: Option<String>,
    pub division_id: Option<String>,
    pub application_type_id: Option<String>,
    pub sub_category_use_id: Option<String>,
    pub assessment_levels: Vec<String>,
    pub show_code: bool,
    pub show_impact: bool,
    #[serde(rename = "ShowIAGA")]
    pub show_iaga: bool,
    #[serde(rename = "ShowIAGI")]
    pub show_iagi: bool,
    pub show_notifiable_code: bool,
    pub show_referral_response: bool,
    pub show_request: bool,
    pub paging_start_index: usize,
    pub max_records: usize,
    pub boundary: Option<String>,
    pub view_port: ViewPort,
    pub include_around_me: bool,
    pub sort_field: String,
    pub sort_ascending: bool,
    #[serde(rename = "BBox")]
    pub bbox: Option<String>,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl ApplicationFilterRequest {
    /// Development applications only; building and plumbing are excluded.
    pub fn for_page(window: &QueryWindow, page: usize, page_size: usize) -> Self {
        Self {
            progress: "all".to_string(),
            start_date_unix_epoch_number: window.start_millis(),
            end_date_unix_epoch_number: window.end_millis(),
            date_range_field: "submitted".to_string(),
            date_range_descriptor: format!(
                "Last {} days",
                (window.end - window.start).num_days()
            ),
            lot_plan: None,
            land_number: None,
            prop_number: None,
            da_number: None,
            ba_number: None,
            plumb_number: None,
            include_da: true,
            include_ba: false,
            include_plumb: false,
            locality_id: None,
            division_id: None,
            application_type_id: None,
            sub_category_use_id: None,
            assessment_levels: Vec::new(),
            show_code: true,
            show_impact: true,
            show_iaga: true,
            show_iagi: true,
            show_notifiable_code: true,
            show_referral_response: true,
            show_request: true,
            paging_start_index: page * page_size,
            max_records: page_size,
            boundary: None,
            view_port: ViewPort::brisbane(),
            include_around_me: true,
            sort_field: "submitted".to_string(),
            sort_ascending: true,
            bbox: None,
            pixel_width: 800,
            pixel_height: 800,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePage {
    #[serde(default)]
    pub total_features: u64,
    #[serde(default)]
    pub features: Vec<RawFeature>,
    /// Applications spanning several points, grouped by an opaque key.
    #[serde(default)]
    pub multi_spot: Option<IndexMap<String, Vec<RawFeature>>>,
}

impl FeaturePage {
    /// Plain features first, then every multi-spot group in response order.
    pub fn into_records(self) -> Vec<RawFeature> {
        let mut records = self.features;
        if let Some(groups) = self.multi_spot {
            records.extend(groups.into_values().flatten());
        }
        records
    }
}

/// Pages still to request after page 0 has declared `total_features`.
pub fn remaining_pages(total_features: u64, page_size: usize) -> usize {
    let page_size = page_size.max(1) as u64;
    if total_features <= page_size {
        return 0;
    }
    (total_features.div_ceil(page_size) - 1) as usize
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, request: &ApplicationFilterRequest)
        -> Result<FeaturePage, FetchError>;
}

/// Live source backed by the council endpoint.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
    run_id: Uuid,
}

impl HttpPageSource {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            run_id,
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(
        &self,
        request: &ApplicationFilterRequest,
    ) -> Result<FeaturePage, FetchError> {
        self.http
            .post_json(self.run_id, &self.endpoint, request)
            .await
    }
}

pub struct Paginator {
    source: Arc<dyn PageSource>,
    window: QueryWindow,
    page_size: usize,
}

impl Paginator {
    pub fn new(source: Arc<dyn PageSource>, window: QueryWindow) -> Self {
        Self {
            source,
            window,
            page_size: PAGE_SIZE,
        }
    }

    pub fn window(&self) -> QueryWindow {
        self.window
    }

    async fn fetch_page(&self, page: usize) -> Result<FeaturePage, FetchError> {
        let request = ApplicationFilterRequest::for_page(&self.window, page, self.page_size);
        let result = self.source.fetch_page(&request).await?;
        debug!(
            page,
            start_index = request.paging_start_index,
            features = result.features.len(),
            "page fetched"
        );
        Ok(result)
    }

    /// Fetch page 0, then every remaining page concurrently.
    ///
    /// Records come back in page order no matter which request finishes
    /// first. Any failed page fails the whole fetch.
    pub async fn fetch_all(&self) -> Result<Vec<RawFeature>, FetchError> {
        let first = self.fetch_page(0).await?;
        let total_features = first.total_features;
        let mut records = first.into_records();

        let remaining = remaining_pages(total_features, self.page_size);
        info!(total_features, remaining, "first page fetched");
        if remaining > 0 {
            let pages = try_join_all((1..=remaining).map(|page| self.fetch_page(page))).await?;
            for page in pages {
                records.extend(page.into_records());
            }
        }

        Ok(records)
    }
}
