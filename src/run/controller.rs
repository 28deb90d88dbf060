//! The run controller: owns every test type's run and drives the batch loops.
//!
//! Each test type has one slot holding its current or most recent [`RunState`]. A start
//! replaces the slot's state wholesale and spawns a task that walks the roster in order.
//! Pause, resume and stop only set flags under the slot lock; the loop honours them at its
//! checkpoint before each device, so an in-flight probe always finishes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use super::{
    Notifier, ProbeResult, RunError, RunEvent, RunOutcome, RunSnapshot, RunState, RunStatus,
    Summary,
};
use crate::catalog::{ParamsRequest, ProbeParams, TestType};
use crate::probe::ProbeAdapter;
use crate::report::{Report, ReportError, ReportFormat, ReportLocation, ReportSource, ReportStore};
use crate::roster::{Device, RosterError, RosterProvider, UNKNOWN_HOP_COUNT};

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// How often a paused loop rechecks its flags without being woken.
    pub pause_poll: Duration,
    /// Formats written for every finished run.
    pub report_formats: Vec<ReportFormat>,
    /// Allow only one active run across all test types.
    pub exclusive: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            pause_poll: Duration::from_millis(500),
            report_formats: vec![ReportFormat::Txt, ReportFormat::Json],
            exclusive: false,
        }
    }
}

#[derive(Default)]
struct Slot {
    state: Mutex<Option<RunState>>,
    /// Wakes a paused loop on resume or stop.
    wake: Notify,
    /// Held while a start fetches its roster.
    starting: Mutex<()>,
}

struct Inner {
    roster: Arc<dyn RosterProvider>,
    probe: Arc<dyn ProbeAdapter>,
    reports: Arc<dyn ReportStore>,
    notifier: Arc<dyn Notifier>,
    settings: ControllerSettings,
    slots: [Slot; TestType::ALL.len()],
    start_gate: Mutex<()>,
    next_run_id: AtomicU64,
}

/// A validated single-device retest, ready to run.
#[derive(Debug, Clone)]
pub struct RetestPlan {
    test_type: TestType,
    device: Device,
    params: ProbeParams,
    run_id: Option<u64>,
}

impl RetestPlan {
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// What the batch loop does next.
enum Step {
    Probe(Device, ProbeParams, bool),
    Wait,
}

/// Owns the run slots of all test types. Cheap to clone.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

impl RunController {
    pub fn new(
        roster: Arc<dyn RosterProvider>,
        probe: Arc<dyn ProbeAdapter>,
        reports: Arc<dyn ReportStore>,
        notifier: Arc<dyn Notifier>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                roster,
                probe,
                reports,
                notifier,
                settings,
                slots: Default::default(),
                start_gate: Mutex::new(()),
                next_run_id: AtomicU64::new(1),
            }),
        }
    }

    fn slot(&self, test_type: TestType) -> &Slot {
        &self.inner.slots[test_type as usize]
    }

    fn publish(&self, event: RunEvent) {
        self.inner.notifier.publish(event);
    }

    /// Start a new batch run.
    pub async fn start(&self, test_type: TestType, req: &ParamsRequest) -> Result<RunSnapshot, RunError> {
        let params = ProbeParams::resolve(test_type, req).map_err(RunError::InvalidParameters)?;

        let slot = self.slot(test_type);
        let _starting = slot
            .starting
            .try_lock()
            .map_err(|_| RunError::AlreadyRunning(test_type))?;
        let _gate = if self.inner.settings.exclusive {
            Some(self.inner.start_gate.lock().await)
        } else {
            None
        };

        self.ensure_startable(test_type).await?;

        let roster = match self.inner.roster.roster(test_type).await {
            Ok(r) if r.devices.is_empty() => Err(RosterError::Empty),
            other => other,
        };
        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);

        let mut guard = slot.state.lock().await;
        if let Some(previous) = guard.as_mut() {
            if previous.needs_persisting() {
                self.persist_run(previous);
            }
        }

        let roster = match roster {
            Ok(roster) => roster,
            Err(e) => {
                tracing::error!("Cannot start {} test: {}", test_type, e);
                let state = RunState::errored(run_id, test_type, params, e.to_string());
                self.publish(RunEvent::Error(outcome(&state)));
                *guard = Some(state);
                return Err(e.into());
            }
        };

        let state = RunState::new(run_id, test_type, params, roster);
        tracing::info!(
            "Starting {} test run {} over {} devices",
            test_type,
            run_id,
            state.progress().total
        );
        self.publish(RunEvent::Started {
            test_type,
            run_id,
            total: state.progress().total,
            parameters: params,
            topology_known: state.roster().topology_known,
            started_at: Utc::now(),
        });

        let snapshot = state.snapshot();
        *guard = Some(state);
        drop(guard);

        tokio::spawn(self.clone().execute(test_type, run_id));
        Ok(snapshot)
    }

    async fn ensure_startable(&self, test_type: TestType) -> Result<(), RunError> {
        for other in TestType::ALL {
            if other != test_type && !self.inner.settings.exclusive {
                continue;
            }
            let guard = self.slot(other).state.lock().await;
            if guard.as_ref().is_some_and(|s| s.status().is_active()) {
                return Err(RunError::AlreadyRunning(other));
            }
        }
        Ok(())
    }

    /// The batch loop of one run.
    async fn execute(self, test_type: TestType, run_id: u64) {
        let slot = self.slot(test_type);
        let mut index = 0;

        loop {
            let step = {
                let mut guard = slot.state.lock().await;
                let Some(state) = guard.as_mut().filter(|s| s.run_id() == run_id) else {
                    return;
                };

                // Running out of devices wins over a late pause or stop.
                let Some(device) = state.roster().devices.get(index).cloned() else {
                    tracing::info!("{} test run {} completed", test_type, run_id);
                    self.finish_run(state, RunStatus::Completed, None);
                    return;
                };

                if state.cancel_requested() {
                    tracing::info!("{} test run {} stopped", test_type, run_id);
                    self.finish_run(state, RunStatus::Stopped, None);
                    return;
                }

                if state.pause_requested() {
                    if state.enter_paused() {
                        tracing::info!("{} test run {} paused", test_type, run_id);
                        self.publish(RunEvent::Paused {
                            test_type,
                            run_id,
                            progress: state.progress(),
                        });
                    }
                    Step::Wait
                } else {
                    if state.leave_paused() {
                        tracing::info!("{} test run {} resumed", test_type, run_id);
                        self.publish(RunEvent::Resumed {
                            test_type,
                            run_id,
                            progress: state.progress(),
                        });
                    }
                    Step::Probe(device, *state.parameters(), state.roster().topology_known)
                }
            };

            let (device, params, topology_known) = match step {
                Step::Probe(device, params, topology_known) => (device, params, topology_known),
                Step::Wait => {
                    tokio::select! {
                        _ = slot.wake.notified() => {}
                        _ = tokio::time::sleep(self.inner.settings.pause_poll) => {}
                    }
                    continue;
                }
            };

            let result = if params.skip_unreachable
                && topology_known
                && device.hop_count == UNKNOWN_HOP_COUNT
            {
                tracing::debug!("Skipping {} ({}): not in topology", device.label, device.address);
                ProbeResult::skipped(&device)
            } else {
                match self.inner.probe.probe(test_type, &device, &params).await {
                    Ok(measurement) => ProbeResult::measured(&device, measurement),
                    Err(e) if e.is_systemic() => {
                        tracing::error!("{} test run {} aborted: {}", test_type, run_id, e);
                        let mut guard = slot.state.lock().await;
                        if let Some(state) = guard.as_mut().filter(|s| s.run_id() == run_id) {
                            self.finish_run(state, RunStatus::Errored, Some(e.to_string()));
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("{} probe failed for {}: {}", test_type, device.address, e);
                        ProbeResult::failed(&device, &e)
                    }
                }
            };

            let mut guard = slot.state.lock().await;
            let Some(state) = guard.as_mut().filter(|s| s.run_id() == run_id) else {
                return;
            };
            match state.record_progress(result) {
                Ok(stored) => {
                    let progress = state.progress();
                    self.publish(RunEvent::Progress {
                        test_type,
                        run_id,
                        current: progress.current,
                        total: progress.total,
                        percent: progress.percent(),
                        result: stored,
                        summary: state.summary(),
                    });
                }
                Err(e) => tracing::error!("Dropping result for {}: {}", device.address, e),
            }
            drop(guard);

            index += 1;
        }
    }

    /// Finalize a run: persist what it has, then announce it.
    fn finish_run(&self, state: &mut RunState, status: RunStatus, error: Option<String>) {
        state.finish(status, error);
        if state.result_count() > 0 {
            self.persist_run(state);
        }

        let outcome = outcome(state);
        self.publish(match status {
            RunStatus::Completed => RunEvent::Completed(outcome),
            RunStatus::Stopped => RunEvent::Stopped(outcome),
            _ => RunEvent::Error(outcome),
        });
    }

    fn persist_run(&self, state: &mut RunState) {
        let report = state.to_report();
        match self.write_reports(&report, &self.inner.settings.report_formats) {
            Ok(locations) => state.set_reports(locations),
            Err(e) => tracing::error!(
                "Failed to write report for {} test run {}: {}",
                state.test_type(),
                state.run_id(),
                e
            ),
        }
    }

    fn write_reports(
        &self,
        report: &Report,
        formats: &[ReportFormat],
    ) -> Result<Vec<ReportLocation>, ReportError> {
        formats
            .iter()
            .map(|format| {
                self.inner.reports.write(report, *format).map(|path| ReportLocation {
                    format: *format,
                    path,
                })
            })
            .collect()
    }

    pub async fn pause(&self, test_type: TestType) -> Result<RunSnapshot, RunError> {
        let slot = self.slot(test_type);
        let mut guard = slot.state.lock().await;
        let state = guard.as_mut().ok_or(RunError::NotRunning(test_type))?;
        state.request_pause()?;
        tracing::info!("Pause requested for {} test", test_type);
        Ok(state.snapshot())
    }

    pub async fn resume(&self, test_type: TestType) -> Result<RunSnapshot, RunError> {
        let slot = self.slot(test_type);
        let mut guard = slot.state.lock().await;
        let state = guard.as_mut().ok_or(RunError::NotRunning(test_type))?;
        state.request_resume()?;
        slot.wake.notify_one();
        tracing::info!("Resume requested for {} test", test_type);
        Ok(state.snapshot())
    }

    pub async fn stop(&self, test_type: TestType) -> Result<RunSnapshot, RunError> {
        let slot = self.slot(test_type);
        let mut guard = slot.state.lock().await;
        let state = guard.as_mut().ok_or(RunError::NotRunning(test_type))?;
        state.request_stop()?;
        slot.wake.notify_one();
        tracing::info!("Stop requested for {} test", test_type);
        Ok(state.snapshot())
    }

    /// Check that a device can be retested now and freeze its parameters.
    pub async fn prepare_retest(
        &self,
        test_type: TestType,
        address: &str,
        overrides: Option<&ParamsRequest>,
    ) -> Result<RetestPlan, RunError> {
        let current = {
            let guard = self.slot(test_type).state.lock().await;
            match guard.as_ref() {
                Some(state) if state.status().is_active() => {
                    return Err(RunError::RetestConflict(test_type));
                }
                Some(state) => state
                    .device(address)
                    .map(|d| (d.clone(), *state.parameters(), state.run_id())),
                None => None,
            }
        };

        let (device, frozen, run_id) = match current {
            Some((device, params, run_id)) => (device, params, Some(run_id)),
            None => {
                let roster = self.inner.roster.roster(test_type).await?;
                let device = roster
                    .position(address)
                    .map(|i| roster.devices[i].clone())
                    .ok_or_else(|| RunError::UnknownDevice(address.to_string()))?;
                (device, ProbeParams::defaults(test_type), None)
            }
        };

        let params = match overrides {
            Some(req) => {
                let merged = ParamsRequest {
                    timeout: req.timeout.or(Some(frozen.timeout_secs)),
                    packet_count: req.packet_count.or(Some(frozen.packet_count)),
                    skip_unreachable: Some(frozen.skip_unreachable),
                };
                ProbeParams::resolve(test_type, &merged).map_err(RunError::InvalidParameters)?
            }
            None => frozen,
        };

        Ok(RetestPlan {
            test_type,
            device,
            params,
            run_id,
        })
    }

    /// Probe the planned device once and fold the result into its run.
    ///
    /// The result is stored only if the run it was planned against is still the slot's
    /// run and is not active; otherwise it is just published.
    pub async fn execute_retest(&self, plan: RetestPlan) -> Result<ProbeResult, RunError> {
        let RetestPlan {
            test_type,
            device,
            params,
            run_id,
        } = plan;

        tracing::info!("Retesting {} ({}) for {}", device.label, device.address, test_type);
        let measurement = match self.inner.probe.probe(test_type, &device, &params).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Retest of {} failed: {}", device.address, e);
                self.publish(RunEvent::DeviceRetestError {
                    test_type,
                    address: device.address.clone(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let result = ProbeResult::measured(&device, measurement);

        let mut guard = self.slot(test_type).state.lock().await;
        let (stored, summary, summary_text) = match guard.as_mut() {
            Some(state) if Some(state.run_id()) == run_id && !state.status().is_active() => {
                let stored = state.upsert_result(result)?.clone();
                self.persist_run(state);
                (stored, Some(state.summary()), Some(state.summary_text()))
            }
            _ => (result, None, None),
        };

        self.publish(RunEvent::DeviceRetestResult {
            test_type,
            run_id,
            result: stored.clone(),
            summary,
            summary_text,
        });
        Ok(stored)
    }

    /// Retest one device of a finished (or never started) run.
    pub async fn retest_device(
        &self,
        test_type: TestType,
        address: &str,
        overrides: Option<&ParamsRequest>,
    ) -> Result<ProbeResult, RunError> {
        let plan = self.prepare_retest(test_type, address, overrides).await?;
        self.execute_retest(plan).await
    }

    /// Write a fresh report from client-edited rows. The run state is left alone.
    pub fn regenerate_report(
        &self,
        test_type: TestType,
        mut results: Vec<ProbeResult>,
        summary_text: Option<String>,
        formats: &[ReportFormat],
    ) -> Result<Vec<ReportLocation>, RunError> {
        if results.is_empty() {
            return Err(RunError::EmptyResults);
        }

        for (i, result) in results.iter_mut().enumerate() {
            if result.sequence == 0 {
                result.sequence = i as u32 + 1;
            }
        }

        let now = Utc::now();
        let summary = Summary::derive(&results, None, None, now);
        let summary_text = summary_text
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| summary.text(test_type));

        let report = Report {
            test_type,
            source: ReportSource::Regenerated,
            generated_at: now,
            started_at: None,
            finished_at: None,
            summary,
            summary_text,
            results,
        };

        let formats = if formats.is_empty() {
            &self.inner.settings.report_formats[..]
        } else {
            formats
        };
        let locations = self.write_reports(&report, formats)?;

        tracing::info!("Regenerated {} report with {} rows", test_type, report.results.len());
        self.publish(RunEvent::ReportRegenerated {
            test_type,
            reports: locations.clone(),
        });
        Ok(locations)
    }

    pub async fn status(&self, test_type: TestType) -> RunSnapshot {
        let guard = self.slot(test_type).state.lock().await;
        match guard.as_ref() {
            Some(state) => state.snapshot(),
            None => RunSnapshot::idle(test_type),
        }
    }

    pub async fn statuses(&self) -> Vec<RunSnapshot> {
        let mut all = Vec::with_capacity(TestType::ALL.len());
        for test_type in TestType::ALL {
            all.push(self.status(test_type).await);
        }
        all
    }

    pub fn latest_report(&self, test_type: TestType, format: ReportFormat) -> Result<PathBuf, RunError> {
        Ok(self.inner.reports.latest(test_type, format)?)
    }
}

fn outcome(state: &RunState) -> RunOutcome {
    RunOutcome {
        test_type: state.test_type(),
        run_id: state.run_id(),
        progress: state.progress(),
        summary: state.summary(),
        summary_text: state.summary_text(),
        results: state.results().cloned().collect(),
        reports: state.reports().to_vec(),
        error: state.error().map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ConnectionStatus, Measurement, ProbeError};
    use crate::report::FsReportStore;
    use crate::roster::Roster;
    use crate::run::EventBus;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{broadcast, Semaphore};
    use tokio_test::{assert_err, assert_ok};

    const A: &str = "fd12::a";
    const B: &str = "fd12::b";
    const C: &str = "fd12::c";

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Up,
        Down,
        Timeout,
        ToolMissing,
    }

    struct StaticRoster {
        devices: Vec<Device>,
        topology_known: bool,
    }

    #[async_trait]
    impl RosterProvider for StaticRoster {
        async fn roster(&self, _test_type: TestType) -> Result<Roster, RosterError> {
            Ok(Roster {
                devices: self.devices.clone(),
                topology_known: self.topology_known,
            })
        }
    }

    /// Probe whose answers are set per address. With a gate, every probe waits for a permit.
    struct ScriptedProbe {
        outcomes: std::sync::Mutex<HashMap<String, Outcome>>,
        gate: Option<Arc<Semaphore>>,
        entered: AtomicUsize,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(gate: Option<Arc<Semaphore>>) -> Self {
            Self {
                outcomes: std::sync::Mutex::new(HashMap::new()),
                gate,
                entered: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        /// Wait until `n` probes have been started, gated or not.
        async fn wait_entered(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.entered.load(Ordering::SeqCst) < n {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
            .await
            .expect("timed out waiting for probe");
        }

        fn set(&self, address: &str, outcome: Outcome) {
            self.outcomes.lock().unwrap().insert(address.to_string(), outcome);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProbeAdapter for ScriptedProbe {
        async fn probe(
            &self,
            _test_type: TestType,
            device: &Device,
            _params: &ProbeParams,
        ) -> Result<Measurement, ProbeError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.calls.fetch_add(1, Ordering::SeqCst);

            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .get(&device.address)
                .copied()
                .unwrap_or(Outcome::Up);

            let mut metrics = Map::new();
            metrics.insert("packets_rx".into(), json!(1));
            match outcome {
                Outcome::Up => Ok(Measurement::new(ConnectionStatus::Connected, metrics)),
                Outcome::Down => Ok(Measurement::new(ConnectionStatus::Disconnected, Map::new())),
                Outcome::Timeout => Err(ProbeError::Timeout(Duration::from_secs(1))),
                Outcome::ToolMissing => Err(ProbeError::ToolMissing("ping".into())),
            }
        }
    }

    struct Harness {
        controller: RunController,
        probe: Arc<ScriptedProbe>,
        gate: Option<Arc<Semaphore>>,
        bus: EventBus,
        _dir: tempfile::TempDir,
        store: FsReportStore,
    }

    impl Harness {
        fn release(&self, n: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(n);
            }
        }
    }

    fn devices(addresses: &[&str]) -> Vec<Device> {
        addresses
            .iter()
            .enumerate()
            .map(|(i, a)| Device::new(&format!("node-{}", i + 1), a))
            .collect()
    }

    fn harness_with(devices: Vec<Device>, topology_known: bool, gated: bool, exclusive: bool) -> Harness {
        let gate = gated.then(|| Arc::new(Semaphore::new(0)));
        let probe = Arc::new(ScriptedProbe::new(gate.clone()));
        let bus = EventBus::with_capacity(256);
        let dir = tempfile::tempdir().unwrap();
        let store = FsReportStore::new(dir.path());

        let controller = RunController::new(
            Arc::new(StaticRoster {
                devices,
                topology_known,
            }),
            probe.clone(),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            ControllerSettings {
                pause_poll: Duration::from_millis(10),
                report_formats: vec![ReportFormat::Txt, ReportFormat::Json],
                exclusive,
            },
        );

        Harness {
            controller,
            probe,
            gate,
            bus,
            _dir: dir,
            store,
        }
    }

    fn harness(gated: bool) -> Harness {
        harness_with(devices(&[A, B, C]), false, gated, false)
    }

    async fn next_event(rx: &mut broadcast::Receiver<RunEvent>) -> RunEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Collect events up to and including the first terminal one.
    async fn until_terminal(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = event.is_terminal();
            events.push(event);
            if done {
                return events;
            }
        }
    }

    async fn until_named(rx: &mut broadcast::Receiver<RunEvent>, name: &str) -> RunEvent {
        loop {
            let event = next_event(rx).await;
            if event.name() == name {
                return event;
            }
        }
    }

    fn fingerprint(snapshot: &RunSnapshot) -> Vec<(u32, String, ConnectionStatus, Map<String, serde_json::Value>)> {
        snapshot
            .results
            .iter()
            .map(|r| (r.sequence, r.address.clone(), r.status, r.metrics.clone()))
            .collect()
    }

    /// Checks the edited ping row of a rendered table whose first row holds the headers.
    fn assert_table_row(table: &[Vec<String>], address: &str) {
        let column = |name: &str| table[0].iter().position(|h| h == name).unwrap();
        let row = table.iter().find(|r| r[column("IP Address")] == address).unwrap();
        assert_eq!(row[column("Packets RX")], "42");
        assert_eq!(row[column("Connection Status")], "Connected");
    }

    #[tokio::test]
    async fn test_completed_run_covers_roster_once() {
        let h = harness(false);
        let mut rx = h.bus.subscribe();

        let started = assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        assert_eq!(started.status, RunStatus::Running);
        assert_eq!(started.progress.total, 3);

        let events = until_terminal(&mut rx).await;
        assert_eq!(events.first().unwrap().name(), "started");
        assert_eq!(events.last().unwrap().name(), "completed");

        let currents: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Progress { current, .. } => Some(*current),
                _ => None,
            })
            .collect();
        assert_eq!(currents, vec![1, 2, 3]);

        let snapshot = h.controller.status(TestType::Ping).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.progress.current, 3);
        assert_eq!(snapshot.results.len(), 3);
        let addresses: Vec<&str> = snapshot.results.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec![A, B, C]);

        // persisted before the terminal event
        assert_eq!(snapshot.reports.len(), 2);
        match events.last().unwrap() {
            RunEvent::Completed(outcome) => {
                assert_eq!(outcome.results.len(), 3);
                assert_eq!(outcome.reports, snapshot.reports);
            }
            other => panic!("unexpected terminal event {:?}", other),
        }
        assert_ok!(h.store.latest(TestType::Ping, ReportFormat::Txt));
        assert_ok!(h.store.latest(TestType::Ping, ReportFormat::Json));
    }

    #[tokio::test]
    async fn test_probe_failure_is_absorbed() {
        let h = harness(false);
        h.probe.set(B, Outcome::Timeout);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        until_terminal(&mut rx).await;

        let snapshot = h.controller.status(TestType::Ping).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.summary.success, 2);
        assert_eq!(snapshot.summary.fail, 1);
        assert_eq!(snapshot.summary.skipped, 0);
        assert_eq!(snapshot.summary.total, 3);

        let b = &snapshot.results[1];
        assert_eq!(b.status, ConnectionStatus::Disconnected);
        assert!(b.metrics.contains_key("error"));
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let h = harness(true);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Rpl, &ParamsRequest::default()).await);
        let err = assert_err!(h.controller.start(TestType::Rpl, &ParamsRequest::default()).await);
        assert!(matches!(err, RunError::AlreadyRunning(TestType::Rpl)));

        h.release(3);
        let events = until_terminal(&mut rx).await;
        assert_eq!(events.iter().filter(|e| e.name() == "started").count(), 1);
        assert_eq!(events.last().unwrap().name(), "completed");
        assert_eq!(h.controller.status(TestType::Rpl).await.results.len(), 3);
    }

    #[tokio::test]
    async fn test_stop_while_running() {
        let h = harness(true);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        h.release(1);
        until_named(&mut rx, "progress").await;

        assert_ok!(h.controller.stop(TestType::Ping).await);
        h.release(10);

        let events = until_terminal(&mut rx).await;
        assert_eq!(events.last().unwrap().name(), "stopped");

        // nothing after the terminal event
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

        let snapshot = h.controller.status(TestType::Ping).await;
        assert_eq!(snapshot.status, RunStatus::Stopped);
        assert!(snapshot.results.len() < 3);
        assert_eq!(snapshot.progress.current, snapshot.results.len());
        assert!(!snapshot.reports.is_empty());

        // terminal until the next start
        assert!(matches!(h.controller.stop(TestType::Ping).await, Err(RunError::NotRunning(_))));
        assert!(matches!(h.controller.pause(TestType::Ping).await, Err(RunError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let h = harness(true);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Rssi, &ParamsRequest::default()).await);
        assert_ok!(h.controller.pause(TestType::Rssi).await);
        h.release(10);
        until_named(&mut rx, "paused").await;

        assert_ok!(h.controller.stop(TestType::Rssi).await);
        let events = until_terminal(&mut rx).await;
        assert!(events.iter().all(|e| e.name() != "resumed"));
        assert_eq!(events.last().unwrap().name(), "stopped");
        assert_eq!(h.controller.status(TestType::Rssi).await.status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_pause_during_last_device_completes() {
        let h = harness(true);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        h.release(2);
        h.probe.wait_entered(3).await;

        assert_ok!(h.controller.pause(TestType::Ping).await);
        h.release(1);

        let events = until_terminal(&mut rx).await;
        assert!(events.iter().all(|e| e.name() != "paused"));
        assert_eq!(events.last().unwrap().name(), "completed");

        let snapshot = h.controller.status(TestType::Ping).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.progress.current, 3);
        assert_eq!(snapshot.reports.len(), 2);

        // finished runs accept retests
        h.release(1);
        assert_ok!(h.controller.retest_device(TestType::Ping, C, None).await);
    }

    #[tokio::test]
    async fn test_stop_during_last_device_completes() {
        let h = harness(true);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Rssi, &ParamsRequest::default()).await);
        h.release(2);
        h.probe.wait_entered(3).await;

        assert_ok!(h.controller.stop(TestType::Rssi).await);
        h.release(1);

        let events = until_terminal(&mut rx).await;
        assert_eq!(events.last().unwrap().name(), "completed");

        let snapshot = h.controller.status(TestType::Rssi).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.results.len(), 3);
        assert_eq!(snapshot.progress.current, 3);
    }

    #[tokio::test]
    async fn test_pause_resume_matches_unpaused_run() {
        let plain = harness(false);
        let mut rx = plain.bus.subscribe();
        assert_ok!(plain.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        until_terminal(&mut rx).await;
        let expected = fingerprint(&plain.controller.status(TestType::Ping).await);

        let h = harness(true);
        let mut rx = h.bus.subscribe();
        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        h.release(1);
        until_named(&mut rx, "progress").await;

        assert_ok!(h.controller.pause(TestType::Ping).await);
        let err = assert_err!(h.controller.pause(TestType::Ping).await);
        assert!(matches!(err, RunError::InvalidTransition { .. }));
        h.release(10);
        until_named(&mut rx, "paused").await;

        let before = h.controller.status(TestType::Ping).await;
        assert_eq!(before.status, RunStatus::Paused);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = h.controller.status(TestType::Ping).await;
        assert_eq!(after.progress, before.progress);
        assert_eq!(after.status, RunStatus::Paused);

        assert_ok!(h.controller.resume(TestType::Ping).await);
        let events = until_terminal(&mut rx).await;
        assert_eq!(events.first().unwrap().name(), "resumed");
        assert_eq!(events.iter().filter(|e| e.name() == "resumed").count(), 1);
        assert_eq!(events.last().unwrap().name(), "completed");

        let snapshot = h.controller.status(TestType::Ping).await;
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(fingerprint(&snapshot), expected);
    }

    #[tokio::test]
    async fn test_pause_and_resume_require_active_run() {
        let h = harness(false);
        assert!(matches!(h.controller.pause(TestType::Ping).await, Err(RunError::NotRunning(_))));
        assert!(matches!(h.controller.resume(TestType::Ping).await, Err(RunError::NotRunning(_))));

        let h = harness(true);
        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        let err = assert_err!(h.controller.resume(TestType::Ping).await);
        assert!(matches!(err, RunError::InvalidTransition { action: "resume", .. }));
        h.release(3);
    }

    #[tokio::test]
    async fn test_retest_after_completion_replaces_entry() {
        let h = harness(false);
        h.probe.set(B, Outcome::Timeout);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        until_terminal(&mut rx).await;
        let before = h.controller.status(TestType::Ping).await;
        assert_eq!(before.summary.fail, 1);

        h.probe.set(B, Outcome::Up);
        let result = assert_ok!(h.controller.retest_device(TestType::Ping, "FD12::B", None).await);
        assert_eq!(result.sequence, 2);
        assert_eq!(result.status, ConnectionStatus::Connected);

        match until_named(&mut rx, "device_retest_result").await {
            RunEvent::DeviceRetestResult { run_id, summary, .. } => {
                assert_eq!(run_id, before.run_id);
                assert_eq!(summary.unwrap().success, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let after = h.controller.status(TestType::Ping).await;
        assert_eq!(after.status, RunStatus::Completed);
        assert_eq!(after.results.len(), 3);
        assert_eq!(after.results[1].sequence, 2);
        assert_eq!(after.results[1].status, ConnectionStatus::Connected);
        assert_eq!(after.summary.success, 3);
        assert_eq!(after.summary.fail, 0);
        assert_eq!(after.progress, before.progress);
    }

    #[tokio::test]
    async fn test_retest_failure_leaves_results() {
        let h = harness(false);
        let mut rx = h.bus.subscribe();
        assert_ok!(h.controller.start(TestType::Rpl, &ParamsRequest::default()).await);
        until_terminal(&mut rx).await;
        let before = fingerprint(&h.controller.status(TestType::Rpl).await);

        h.probe.set(C, Outcome::Timeout);
        assert_err!(h.controller.retest_device(TestType::Rpl, C, None).await);
        assert_eq!(until_named(&mut rx, "device_retest_error").await.name(), "device_retest_error");

        assert_eq!(fingerprint(&h.controller.status(TestType::Rpl).await), before);
    }

    #[tokio::test]
    async fn test_retest_rejected_while_batch_active() {
        let h = harness(true);
        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);

        let err = assert_err!(h.controller.retest_device(TestType::Ping, A, None).await);
        assert!(matches!(err, RunError::RetestConflict(TestType::Ping)));
        h.release(3);
    }

    #[tokio::test]
    async fn test_retest_planned_on_old_run_does_not_touch_new_run() {
        let h = harness(true);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        h.release(3);
        until_terminal(&mut rx).await;
        let old_run = h.controller.status(TestType::Ping).await.run_id;
        let plan = assert_ok!(h.controller.prepare_retest(TestType::Ping, B, None).await);

        // new run holds its first probe, then pauses after it
        let new_run = assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        assert_ne!(new_run.run_id, old_run);
        h.probe.wait_entered(4).await;
        assert_ok!(h.controller.pause(TestType::Ping).await);

        let controller = h.controller.clone();
        let retest = tokio::spawn(async move { controller.execute_retest(plan).await });
        h.probe.wait_entered(5).await;
        h.release(2);

        let result = assert_ok!(retest.await.unwrap());
        assert_eq!(result.address, B);

        let mut retest_event = None;
        let mut paused = false;
        while retest_event.is_none() || !paused {
            match next_event(&mut rx).await {
                RunEvent::DeviceRetestResult { run_id, summary, .. } => {
                    retest_event = Some((run_id, summary))
                }
                RunEvent::Paused { .. } => paused = true,
                _ => {}
            }
        }

        let snapshot = h.controller.status(TestType::Ping).await;
        assert_eq!(snapshot.run_id, new_run.run_id);
        assert_eq!(snapshot.status, RunStatus::Paused);
        assert_eq!(snapshot.progress.current, 1);
        let addresses: Vec<&str> = snapshot.results.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec![A]);

        let (run_id, summary) = retest_event.unwrap();
        assert_eq!(run_id, old_run);
        assert!(summary.is_none());

        assert_ok!(h.controller.stop(TestType::Ping).await);
        until_terminal(&mut rx).await;
    }

    #[tokio::test]
    async fn test_retest_without_run_only_publishes() {
        let h = harness(false);
        let mut rx = h.bus.subscribe();

        let err = assert_err!(h.controller.retest_device(TestType::Availability, "fd12::99", None).await);
        assert!(matches!(err, RunError::UnknownDevice(_)));

        assert_ok!(h.controller.retest_device(TestType::Availability, B, None).await);
        match until_named(&mut rx, "device_retest_result").await {
            RunEvent::DeviceRetestResult { run_id, summary, .. } => {
                assert_eq!(run_id, None);
                assert!(summary.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.controller.status(TestType::Availability).await.status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_retest_parameter_override_is_validated() {
        let h = harness(false);
        let bad = ParamsRequest {
            timeout: Some(0),
            ..Default::default()
        };
        let err = assert_err!(h.controller.prepare_retest(TestType::Ping, A, Some(&bad)).await);
        assert!(matches!(err, RunError::InvalidParameters(_)));

        let ok = ParamsRequest {
            packet_count: Some(4),
            ..Default::default()
        };
        let plan = assert_ok!(h.controller.prepare_retest(TestType::Ping, A, Some(&ok)).await);
        assert_eq!(plan.params.packet_count, 4);
        assert_eq!(plan.params.timeout_secs, 10);
    }

    #[tokio::test]
    async fn test_regenerate_report_uses_edited_rows() {
        let h = harness(false);
        h.probe.set(B, Outcome::Down);
        let mut rx = h.bus.subscribe();
        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        until_terminal(&mut rx).await;
        let before = h.controller.status(TestType::Ping).await;

        let mut edited = before.results.clone();
        edited[1].status = ConnectionStatus::Connected;
        edited[1].metrics.insert("packets_rx".into(), json!(42));
        edited[1].metrics.insert("note".into(), json!("checked on site"));

        let locations = assert_ok!(h.controller.regenerate_report(
            TestType::Ping,
            edited,
            Some("SUMMARY: edited".into()),
            &[ReportFormat::Json, ReportFormat::Txt, ReportFormat::Csv],
        ));
        assert_eq!(locations.len(), 3);
        assert_eq!(locations[1].format, ReportFormat::Txt);
        assert_eq!(locations[2].format, ReportFormat::Csv);

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&locations[0].path).unwrap()).unwrap();
        assert_eq!(written["source"]["kind"], "regenerated");
        assert_eq!(written["summary_text"], "SUMMARY: edited");
        assert_eq!(written["summary"]["success"], 3);
        assert_eq!(written["results"][1]["status"], "Connected");
        assert_eq!(written["results"][1]["metrics"]["note"], "checked on site");
        assert_eq!(written["results"][1]["metrics"]["packets_rx"], 42);

        // tables show the edited row
        let txt = std::fs::read_to_string(&locations[1].path).unwrap();
        let table: Vec<Vec<String>> = txt
            .lines()
            .filter(|l| l.starts_with('|'))
            .map(|l| {
                l.trim_matches('|')
                    .split('|')
                    .map(|c| c.trim().to_string())
                    .collect()
            })
            .collect();
        assert_table_row(&table, B);
        assert!(txt.contains("SUMMARY: edited"));

        let mut reader = csv::Reader::from_path(&locations[2].path).unwrap();
        let mut table = vec![reader
            .headers()
            .unwrap()
            .iter()
            .map(String::from)
            .collect::<Vec<_>>()];
        for record in reader.records() {
            table.push(record.unwrap().iter().map(String::from).collect());
        }
        assert_table_row(&table, B);

        let after = h.controller.status(TestType::Ping).await;
        assert_eq!(fingerprint(&after), fingerprint(&before));
        assert_eq!(after.summary.fail, 1);

        let err = assert_err!(h.controller.regenerate_report(TestType::Ping, vec![], None, &[]));
        assert!(matches!(err, RunError::EmptyResults));
    }

    #[tokio::test]
    async fn test_systemic_fault_errors_the_run() {
        let h = harness(false);
        h.probe.set(B, Outcome::ToolMissing);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        let events = until_terminal(&mut rx).await;
        match events.last().unwrap() {
            RunEvent::Error(outcome) => {
                assert!(outcome.error.as_deref().unwrap().contains("ping"));
                assert_eq!(outcome.results.len(), 1);
            }
            other => panic!("unexpected terminal event {:?}", other),
        }

        let snapshot = h.controller.status(TestType::Ping).await;
        assert_eq!(snapshot.status, RunStatus::Errored);
        // partial results are still persisted
        assert!(!snapshot.reports.is_empty());
        assert_eq!(h.probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_roster_errors_the_run() {
        let h = harness_with(Vec::new(), false, false, false);
        let mut rx = h.bus.subscribe();

        let err = assert_err!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        assert!(matches!(err, RunError::Roster(RosterError::Empty)));
        assert_eq!(next_event(&mut rx).await.name(), "error");
        assert_eq!(h.controller.status(TestType::Ping).await.status, RunStatus::Errored);
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected_before_run() {
        let h = harness(false);
        let req = ParamsRequest {
            packet_count: Some(0),
            ..Default::default()
        };
        let err = assert_err!(h.controller.start(TestType::Ping, &req).await);
        assert!(matches!(err, RunError::InvalidParameters(_)));
        assert_eq!(h.controller.status(TestType::Ping).await.status, RunStatus::Idle);
        assert_eq!(h.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_skip_unreachable_devices() {
        let mut roster = devices(&[A, B, C]);
        roster[0].hop_count = 1;
        roster[2].hop_count = 2;
        let h = harness_with(roster, true, false, false);
        let mut rx = h.bus.subscribe();

        let req = ParamsRequest {
            skip_unreachable: Some(true),
            ..Default::default()
        };
        assert_ok!(h.controller.start(TestType::Availability, &req).await);
        until_terminal(&mut rx).await;

        let snapshot = h.controller.status(TestType::Availability).await;
        assert_eq!(snapshot.results[1].status, ConnectionStatus::Skipped);
        assert_eq!(snapshot.summary.skipped, 1);
        assert_eq!(snapshot.summary.success, 2);
        assert_eq!(snapshot.summary.success_rate, 100.0);
        assert_eq!(h.probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_test_types_run_side_by_side() {
        let h = harness(true);
        let mut rx = h.bus.subscribe();
        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        assert_ok!(h.controller.start(TestType::Rpl, &ParamsRequest::default()).await);
        h.release(6);

        let mut done = 0;
        while done < 2 {
            if next_event(&mut rx).await.is_terminal() {
                done += 1;
            }
        }
        assert_eq!(h.controller.status(TestType::Ping).await.status, RunStatus::Completed);
        assert_eq!(h.controller.status(TestType::Rpl).await.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_exclusive_mode_blocks_other_test_types() {
        let h = harness_with(devices(&[A, B, C]), false, true, true);
        let mut rx = h.bus.subscribe();

        assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        let err = assert_err!(h.controller.start(TestType::Rpl, &ParamsRequest::default()).await);
        assert!(matches!(err, RunError::AlreadyRunning(TestType::Ping)));

        h.release(3);
        until_terminal(&mut rx).await;
        h.release(3);
        assert_ok!(h.controller.start(TestType::Rpl, &ParamsRequest::default()).await);
    }

    #[tokio::test]
    async fn test_restart_replaces_finished_run() {
        let h = harness(false);
        let mut rx = h.bus.subscribe();

        let first = assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        until_terminal(&mut rx).await;
        let second = assert_ok!(h.controller.start(TestType::Ping, &ParamsRequest::default()).await);
        assert_ne!(first.run_id, second.run_id);
        assert!(second.results.is_empty());
        until_terminal(&mut rx).await;
        assert_eq!(h.controller.status(TestType::Ping).await.results.len(), 3);
    }
}
