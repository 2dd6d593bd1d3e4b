//! Test doubles shared across module tests: a scripted HTTP transport, a
//! manual clock and a ready-to-use in-memory store.

use crate::db::{setup_database, CrimeRecord, LocationRecord};
use crate::error::FetchError;
use crate::http::{Fetcher, HttpClient, HttpRequest, HttpResponse};
use crate::rate_limit::{Clock, IntervalGate};
use rusqlite::Connection;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

// ============================================================================
// MANUAL CLOCK
// ============================================================================

#[derive(Clone)]
pub struct ManualClock {
    inner: Rc<RefCell<ClockState>>,
}

struct ClockState {
    now: Instant,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            inner: Rc::new(RefCell::new(ClockState {
                now: Instant::now(),
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.inner.borrow_mut().now += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.borrow().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.borrow().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.inner.borrow_mut();
        state.now += duration;
        state.sleeps.push(duration);
    }
}

// ============================================================================
// SCRIPTED HTTP
// ============================================================================

/// Replays queued responses in order and records every request.
/// An exhausted script answers 503.
#[derive(Clone, Default)]
pub struct FakeHttp {
    script: Rc<RefCell<VecDeque<Result<HttpResponse, FetchError>>>>,
    requests: Rc<RefCell<Vec<HttpRequest>>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&self, body: serde_json::Value) -> &Self {
        self.push_status(200, &body.to_string())
    }

    pub fn push_status(&self, status: u16, body: &str) -> &Self {
        self.script.borrow_mut().push_back(Ok(HttpResponse {
            status,
            body: body.to_string(),
        }));
        self
    }

    pub fn push_error(&self, error: FetchError) -> &Self {
        self.script.borrow_mut().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.borrow().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }

    /// Fetcher over this script with a manual clock (no real sleeping)
    pub fn fetcher(&self, clock: &ManualClock) -> Fetcher {
        Fetcher::new(
            Box::new(self.clone()),
            IntervalGate::with_clock(Duration::from_millis(100), Box::new(clock.clone())),
            Duration::from_secs(2),
        )
    }
}

impl HttpClient for FakeHttp {
    fn get(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
        self.requests.borrow_mut().push(request.clone());
        self.script.borrow_mut().pop_front().unwrap_or(Ok(HttpResponse {
            status: 503,
            body: String::new(),
        }))
    }
}

// ============================================================================
// STORE
// ============================================================================

pub fn memory_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    setup_database(&conn).unwrap();
    conn
}

/// Crime with every field populated
pub fn sample_crime(external_id: &str, month: &str) -> CrimeRecord {
    CrimeRecord {
        external_id: external_id.to_string(),
        persistent_id: Some(format!("p-{}", external_id)),
        month: month.to_string(),
        category: Some("burglary".to_string()),
        lat: Some(51.51),
        lon: Some(-0.12),
        street_id: Some(1001),
        street_name: Some("On or near Strand".to_string()),
        outcome_category: None,
        outcome_date: None,
    }
}

pub fn sample_location(label: &str, lat: f64, lon: f64) -> LocationRecord {
    LocationRecord {
        label: label.to_string(),
        city: Some("London".to_string()),
        county: None,
        region: Some("Greater London".to_string()),
        lat: Some(lat),
        lon: Some(lon),
    }
}
