//! In-memory stand-in for the channel API shared by the sync tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use cs_channel::{ChannelApi, ChannelError, DateFilter, Mapper, Page, Resource};
use cs_core::config::ReconcileConfig;
use cs_core::store::Store;
use cs_sync::{Reconciler, SafetyGuard};
use serde_json::{json, Value};

/// Scripted answer for a by-id lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    NotFound,
    Transient,
    Auth,
    Record(Value),
}

pub struct FakeChannel {
    pub listings: Mutex<Vec<Value>>,
    pub clients: Mutex<Vec<Value>>,
    pub reservations: Mutex<Vec<Value>>,
    /// Left out of the list feed but still served by id.
    pub hidden: Mutex<HashSet<String>>,
    pub lookups: Mutex<HashMap<String, Lookup>>,
    /// Reservation pages at these offsets fail as transient errors.
    pub failing_skips: Mutex<HashSet<u64>>,
    pub auth_broken: AtomicBool,
    pub page_size: u32,
    pub max_pages: u32,
    pub page_calls: AtomicUsize,
    /// By-id reservation lookups.
    pub lookup_calls: AtomicUsize,
    pub listing_lookups: AtomicUsize,
}

impl Default for FakeChannel {
    fn default() -> Self {
        Self {
            listings: Mutex::default(),
            clients: Mutex::default(),
            reservations: Mutex::default(),
            hidden: Mutex::default(),
            lookups: Mutex::default(),
            failing_skips: Mutex::default(),
            auth_broken: AtomicBool::new(false),
            page_size: 20,
            max_pages: 100,
            page_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
            listing_lookups: AtomicUsize::new(0),
        }
    }
}

impl FakeChannel {
    pub fn with_reservations(items: Vec<Value>) -> Arc<Self> {
        let fake = Self::default();
        *fake.reservations.lock().unwrap() = items;
        Arc::new(fake)
    }

    pub fn hide(&self, id: &str) {
        self.hidden.lock().unwrap().insert(id.to_string());
    }

    pub fn unhide(&self, id: &str) {
        self.hidden.lock().unwrap().remove(id);
    }

    pub fn remove(&self, id: &str) {
        self.reservations
            .lock()
            .unwrap()
            .retain(|r| r["_id"].as_str() != Some(id));
    }

    pub fn script_lookup(&self, id: &str, answer: Lookup) {
        self.lookups.lock().unwrap().insert(id.to_string(), answer);
    }

    pub fn lookups_made(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    fn feed(&self, resource: Resource) -> Vec<Value> {
        match resource {
            Resource::Listings => self.listings.lock().unwrap().clone(),
            Resource::Clients => self.clients.lock().unwrap().clone(),
            Resource::Reservations => {
                let hidden = self.hidden.lock().unwrap();
                self.reservations
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|r| !r["_id"].as_str().is_some_and(|id| hidden.contains(id)))
                    .cloned()
                    .collect()
            }
        }
    }
}

#[async_trait]
impl ChannelApi for FakeChannel {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    async fn fetch_page(
        &self,
        resource: Resource,
        _filter: Option<&DateFilter>,
        skip: u64,
    ) -> cs_channel::Result<Page> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.auth_broken.load(Ordering::SeqCst) {
            return Err(ChannelError::Auth("401 Unauthorized".into()));
        }
        if resource == Resource::Reservations && self.failing_skips.lock().unwrap().contains(&skip) {
            return Err(ChannelError::Transient("503 Service Unavailable".into()));
        }
        let items: Vec<Value> = self
            .feed(resource)
            .into_iter()
            .skip(skip as usize)
            .take(self.page_size as usize)
            .collect();
        let n = items.len() as u64;
        Ok(Page {
            items,
            skip,
            next_cursor: (n >= u64::from(self.page_size)).then_some(skip + n),
        })
    }

    async fn fetch_by_id(&self, resource: Resource, external_id: &str) -> cs_channel::Result<Value> {
        match resource {
            Resource::Listings => self.listing_lookups.fetch_add(1, Ordering::SeqCst),
            _ => self.lookup_calls.fetch_add(1, Ordering::SeqCst),
        };
        if self.auth_broken.load(Ordering::SeqCst) {
            return Err(ChannelError::Auth("401 Unauthorized".into()));
        }
        let scripted = self.lookups.lock().unwrap().get(external_id).cloned();
        let not_found = || ChannelError::NotFound {
            resource: resource.as_str(),
            external_id: external_id.to_string(),
        };
        match scripted {
            Some(Lookup::NotFound) => Err(not_found()),
            Some(Lookup::Transient) => Err(ChannelError::Transient("timed out".into())),
            Some(Lookup::Auth) => Err(ChannelError::Auth("403 Forbidden".into())),
            Some(Lookup::Record(v)) => Ok(v),
            None => {
                let pool = match resource {
                    Resource::Listings => &self.listings,
                    Resource::Clients => &self.clients,
                    Resource::Reservations => &self.reservations,
                };
                pool.lock()
                    .unwrap()
                    .iter()
                    .find(|r| r["_id"].as_str() == Some(external_id))
                    .cloned()
                    .ok_or_else(not_found)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn days_from_today(days: u64) -> NaiveDate {
    let today = Utc::now().date_naive();
    today.checked_add_days(Days::new(days)).unwrap()
}

/// A booked stay on its own listing, arriving in `days` days.
pub fn booked(id: &str, days: u64) -> Value {
    remote_reservation(id, &format!("L-{id}"), days, "booked")
}

pub fn remote_reservation(id: &str, listing: &str, days: u64, kind: &str) -> Value {
    let check_in = days_from_today(days);
    let check_out = check_in.checked_add_days(Days::new(3)).unwrap();
    json!({
        "_id": id,
        "_idlisting": listing,
        "type": kind,
        "checkInDate": check_in.to_string(),
        "checkOutDate": check_out.to_string(),
        "price": {"_f_total": 1250.5, "currency": "BRL"},
        "partner": {"name": "Airbnb"},
    })
}

pub fn reservation_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("R{i:04}")).collect()
}

pub fn reconciler(store: &Store, fake: &Arc<FakeChannel>, config: ReconcileConfig) -> Reconciler {
    let api: Arc<dyn ChannelApi> = fake.clone();
    let mapper = Arc::new(Mapper::new());
    let guard = SafetyGuard::new(api.clone(), mapper.clone());
    Reconciler::new(store.clone(), api, mapper, guard, config)
}

pub fn guard(fake: &Arc<FakeChannel>) -> SafetyGuard {
    let api: Arc<dyn ChannelApi> = fake.clone();
    SafetyGuard::new(api, Arc::new(Mapper::new()))
}
