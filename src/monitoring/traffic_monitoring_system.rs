use crate::communication::Mailbox;
use crate::config::MonitoringTuning;
use crate::control_system::{ClaimRegistry, RerouteLog};
use crate::error::ControlResult;
use crate::scheduler::{secs, Controller};
use crate::shared_data::current_timestamp;
use crate::simulation_engine::SimulationSurface;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STATUS_REPORTS_FILE: &str = "status_reports.csv";
pub const TRAFFIC_SUMMARY_FILE: &str = "traffic_summary.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReportRecord {
    pub timestamp: u64,
    pub sender: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSummaryRecord {
    pub timestamp: u64,
    pub simulation_time: f64,
    pub vehicles: usize,
    pub average_speed: f64,
    pub claimed_vehicles: usize,
    pub rerouted_vehicles: usize,
}

/// Appends one record, writing the header only when the file is new.
pub fn log_to_csv<T: Serialize>(path: &Path, record: &T) -> ControlResult<()> {
    let file_exists = path.exists();
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);
    wtr.serialize(record)?;
    wtr.flush()?;
    Ok(())
}

pub fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> ControlResult<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        records.push(result?);
    }
    Ok(records)
}

/// Collects status reports from the controllers and writes periodic summaries.
pub struct MonitoringSystem {
    mailbox: Mailbox,
    surface: Arc<dyn SimulationSurface>,
    registry: Arc<ClaimRegistry>,
    reroutes: Arc<RerouteLog>,
    tuning: MonitoringTuning,
    /// Last report body per sender.
    agent_states: BTreeMap<String, String>,
    last_summary: Option<f64>,
}

impl MonitoringSystem {
    pub fn new(
        mailbox: Mailbox,
        surface: Arc<dyn SimulationSurface>,
        registry: Arc<ClaimRegistry>,
        reroutes: Arc<RerouteLog>,
        tuning: MonitoringTuning,
    ) -> ControlResult<Self> {
        std::fs::create_dir_all(&tuning.report_dir)?;
        Ok(Self {
            mailbox,
            surface,
            registry,
            reroutes,
            tuning,
            agent_states: BTreeMap::new(),
            last_summary: None,
        })
    }

    pub fn agent_states(&self) -> &BTreeMap<String, String> {
        &self.agent_states
    }

    pub fn report_path(&self, file: &str) -> PathBuf {
        self.tuning.report_dir.join(file)
    }

    pub fn record_report(&mut self, sender: &str, body: &str) {
        log::info!("[Monitor] Received report from {}: {}", sender, body);
        self.agent_states
            .insert(sender.to_string(), body.to_string());
        let record = StatusReportRecord {
            timestamp: current_timestamp(),
            sender: sender.to_string(),
            body: body.to_string(),
        };
        if let Err(e) = log_to_csv(&self.report_path(STATUS_REPORTS_FILE), &record) {
            log::warn!("[Monitor] Error logging status report: {}", e);
        }
    }

    /// Writes a summary when one is due. Skipped while the simulation is down.
    pub fn maybe_summarize(&mut self) -> ControlResult<Option<TrafficSummaryRecord>> {
        if !self.surface.is_available() {
            return Ok(None);
        }
        let now = self.surface.current_time()?;
        if self
            .last_summary
            .is_some_and(|last| now - last < self.tuning.summary_period)
        {
            return Ok(None);
        }
        let vehicles = self.surface.vehicle_ids()?;
        let mut total_speed = 0.0;
        for vehicle in &vehicles {
            total_speed += self.surface.vehicle_speed(vehicle).unwrap_or(0.0);
        }
        let average_speed = if vehicles.is_empty() {
            0.0
        } else {
            total_speed / vehicles.len() as f64
        };
        let record = TrafficSummaryRecord {
            timestamp: current_timestamp(),
            simulation_time: now,
            vehicles: vehicles.len(),
            average_speed,
            claimed_vehicles: self.registry.claimed_count(),
            rerouted_vehicles: self.reroutes.count(),
        };
        self.last_summary = Some(now);
        log::info!(
            "[Monitor] Step: {:.0}, Vehicles: {}, Avg Speed: {:.2}, Claimed: {}, Rerouted: {}",
            now,
            record.vehicles,
            record.average_speed,
            record.claimed_vehicles,
            record.rerouted_vehicles
        );
        if let Err(e) = log_to_csv(&self.report_path(TRAFFIC_SUMMARY_FILE), &record) {
            log::warn!("[Monitor] Error logging traffic summary: {}", e);
        }
        Ok(Some(record))
    }
}

impl Controller for MonitoringSystem {
    fn name(&self) -> String {
        "MonitoringSystem".to_string()
    }

    async fn tick(&mut self) -> ControlResult<()> {
        let timeout = secs(self.tuning.report_timeout_secs);
        if let Some(message) = self.mailbox.receive(timeout).await {
            self.record_report(&message.sender, &message.body);
        }
        self.maybe_summarize()?;
        Ok(())
    }
}
