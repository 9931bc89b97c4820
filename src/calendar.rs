/// calendar.rs — market-calendar provider boundary (§6 Calendar
/// provider) and a lazily-cached adapter around it (§4.A).
use anyhow::Result;
use chrono::NaiveDate;
use std::collections::HashSet;

/// Abstract calendar provider: returns the set of valid trading days
/// in `[start, end]`.
#[async_trait::async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn valid_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>>;
}

/// The NYSE calendar, fetched from Alpaca's `/v2/calendar` endpoint.
/// Kept deliberately thin: weekday-minus-holidays logic lives on the
/// server side of this boundary, not here.
pub struct AlpacaCalendar {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl AlpacaCalendar {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self { client: reqwest::Client::new(), base_url, api_key, api_secret }
    }
}

#[derive(serde::Deserialize)]
struct CalendarDay {
    date: NaiveDate,
}

#[async_trait::async_trait]
impl CalendarProvider for AlpacaCalendar {
    async fn valid_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        let url = format!(
            "{}/v2/calendar?start={}&end={}",
            self.base_url,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        let resp = self
            .client
            .get(&url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .send()
            .await?;
        let days: Vec<CalendarDay> = resp.json().await?;
        Ok(days.into_iter().map(|d| d.date).collect())
    }
}

/// Caches `open_dates` for a single `[start,end]` window, materialized
/// lazily on first use, per §4.A. A fresh `CalendarCache` per run keeps
/// this correct without needing invalidation logic.
pub struct CalendarCache {
    open_dates: Option<HashSet<NaiveDate>>,
}

impl CalendarCache {
    pub fn new() -> Self {
        Self { open_dates: None }
    }

    pub async fn ensure_loaded(
        &mut self,
        provider: &dyn CalendarProvider,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<()> {
        if self.open_dates.is_none() {
            let days = provider.valid_days(start, end).await?;
            self.open_dates = Some(days.into_iter().collect());
        }
        Ok(())
    }

    pub fn is_open(&self, date: NaiveDate) -> bool {
        self.open_dates.as_ref().map(|set| set.contains(&date)).unwrap_or(false)
    }
}

impl Default for CalendarCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    struct FixedCalendar(Vec<NaiveDate>);

    #[async_trait::async_trait]
    impl CalendarProvider for FixedCalendar {
        async fn valid_days(&self, _start: NaiveDate, _end: NaiveDate) -> Result<Vec<NaiveDate>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn cache_loads_once_and_reports_membership() {
        let d = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let provider = FixedCalendar(vec![d]);
        let mut cache = CalendarCache::new();
        cache.ensure_loaded(&provider, d, d).await.unwrap();
        assert!(cache.is_open(d));
        assert!(!cache.is_open(d.succ_opt().unwrap()));
    }
}
