//! Job handles: statistics, agent targets, CPU accounting, archival.
//!
//! A job's statistics live in three places with three failure modes:
//! the control plane's view page (scraped HTML), the job's own results
//! database (counts), and the worker host (load and memory via shell).
//! The handle stitches them into one snapshot per poll.
//!
//! CPU accounting is the subtle part. Agent processes restart
//! constantly, and `ps` reports per-process cumulative time, so naive
//! summation undercounts whenever a process dies. The ledger folds the
//! last observed time of every vanished PID into a dead accumulator,
//! exactly once, and reports dead plus live as the job total. The
//! total is monotone by construction; a decrease means the accounting
//! is wrong and is reported as a data-quality error rather than
//! silently absorbed.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    controller::{Adjustment, Controller},
    error::{Error, Result},
    session::Context,
    web::WebRequest,
};

/// One fuzzing job as the control plane and store know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Control-plane id, used in URLs.
    pub id: i64,
    /// Unique name, used in agent-target forms.
    pub name: String,
    /// Name of the job's database on the store.
    pub db_name: String,
}

impl Job {
    /// A job whose database follows the standard prefix convention.
    #[must_use]
    pub fn new(id: i64, name: &str, db_prefix: &str) -> Self {
        Self {
            id,
            name: name.into(),
            db_name: format!("{db_prefix}{name}"),
        }
    }

    /// A job with an explicitly known database name, as listed by the
    /// management database.
    #[must_use]
    pub fn with_db(id: i64, name: &str, db_name: &str) -> Self {
        Self {
            id,
            name: name.into(),
            db_name: db_name.into(),
        }
    }
}

/// Lifecycle state of a job handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Exists on the control plane, no agents assigned yet.
    Created,
    /// Agents assigned, producing results.
    Active,
    /// All agent targets set to zero, winding down.
    Draining,
    /// Archived; terminal.
    Archived,
}

/// One statistics snapshot across all three sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStats {
    /// Testcases fully processed by the fleet.
    pub completed_testcases: u64,
    /// Current corpus population.
    pub population: u64,
    /// Access violations, total and deduplicated.
    pub access_violations_total: u64,
    pub access_violations_unique: u64,
    /// Crashes, total and deduplicated.
    pub crashes_total: u64,
    pub crashes_unique: u64,
    /// Hanging testcases.
    pub hangs: u64,
    /// Testcases the target never answered for.
    pub no_response: u64,
    /// Distinct covered basic blocks.
    pub covered_blocks: u64,
    /// Live pool managers.
    pub active_pool: u64,
    /// Live agents by role.
    pub active_generators: u64,
    pub active_runners: u64,
    pub active_evaluators: u64,
    /// Interesting testcases recorded in the job database.
    pub testcases: u64,
    /// Distinct coverage edges recorded in the job database.
    pub paths: u64,
    /// Worker one-minute load average.
    pub load: f64,
    /// Worker memory utilization in percent.
    pub memory_used: f64,
}

/// Fields scraped from the control plane's job view page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStats {
    pub completed_testcases: u64,
    pub population: u64,
    pub access_violations_total: u64,
    pub access_violations_unique: u64,
    pub crashes_total: u64,
    pub crashes_unique: u64,
    pub hangs: u64,
    pub no_response: u64,
    pub covered_blocks: u64,
    pub active_pool: u64,
    pub active_generators: u64,
    pub active_runners: u64,
    pub active_evaluators: u64,
}

/// Scrape the job view page. The page renders statistics as centered
/// table cells in a fixed order; the first ten are required, the agent
/// counts near the end are rendered only while agents are live and
/// default to zero when absent.
///
/// # Errors
///
/// Returns `DataQuality` if a required cell is missing or unparsable.
pub fn parse_view_page(body: &str) -> Result<ViewStats> {
    let pattern = regex::Regex::new(r#"<td style="text-align: center;">(.+?)</td>"#)
        .map_err(|e| Error::DataQuality(format!("view page pattern: {e}")))?;
    let cells: Vec<&str> = pattern
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    let required = |i: usize| -> Result<&str> {
        cells
            .get(i)
            .copied()
            .ok_or_else(|| Error::DataQuality(format!("view page cell {i} missing")))
    };
    let number = |i: usize| -> Result<u64> {
        let raw = required(i)?;
        raw.trim()
            .parse()
            .map_err(|_| Error::DataQuality(format!("view page cell {i}: `{raw}`")))
    };
    // Population renders as "current / limit".
    let population = {
        let raw = required(1)?;
        let current = raw.split(" /").next().unwrap_or(raw).trim();
        current
            .parse()
            .map_err(|_| Error::DataQuality(format!("population cell: `{raw}`")))?
    };
    let optional = |i: usize| -> u64 {
        cells
            .get(i)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    };
    let stats = ViewStats {
        completed_testcases: number(0)?,
        population,
        access_violations_total: number(2)?,
        access_violations_unique: number(3)?,
        crashes_total: number(4)?,
        crashes_unique: number(5)?,
        hangs: number(6)?,
        no_response: number(7)?,
        covered_blocks: number(8)?,
        active_pool: number(9)?,
        active_runners: optional(11),
        active_evaluators: optional(12),
        active_generators: optional(13),
    };
    if cells.get(11).is_none() {
        warn!("view page missing live agent counts, reporting zeros");
    }
    Ok(stats)
}

/// Parse a `ps` cumulative TIME field: `[[dd-]hh:]mm:ss`.
///
/// # Errors
///
/// Returns `DataQuality` on any other shape.
pub fn parse_cpu_time(raw: &str) -> Result<u64> {
    let bad = || Error::DataQuality(format!("cpu time field: `{raw}`"));
    let (days, clock) = match raw.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| bad())?, rest),
        None => (0, raw),
    };
    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.parse::<u64>().map_err(|_| bad()))
        .collect::<Result<_>>()?;
    let (hours, minutes, seconds) = match parts[..] {
        [m, s] => (0, m, s),
        [h, m, s] => (h, m, s),
        _ => return Err(bad()),
    };
    Ok(((days * 24 + hours) * 60 + minutes) * 60 + seconds)
}

/// Monotone CPU-time ledger over restarting agent processes.
#[derive(Debug, Default)]
pub struct CpuLedger {
    seen: HashMap<u32, u64>,
    dead: u64,
    last_total: Option<u64>,
}

impl CpuLedger {
    /// Fresh ledger with nothing accumulated.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one `(pid, cumulative seconds)` sample set into the ledger
    /// and return the job's total CPU seconds.
    ///
    /// # Errors
    ///
    /// Returns `DataQuality` if the total decreased against the
    /// previous observation. The sample is still folded in; only the
    /// monotonicity check failed.
    pub fn observe(&mut self, samples: &[(u32, u64)]) -> Result<u64> {
        let live: HashMap<u32, u64> = samples.iter().copied().collect();
        // A vanished PID contributes its last observed time exactly
        // once, then leaves the map.
        self.seen.retain(|pid, secs| {
            if live.contains_key(pid) {
                true
            } else {
                self.dead += *secs;
                false
            }
        });
        self.seen = live;
        let total = self.dead + self.seen.values().sum::<u64>();
        if let Some(last) = self.last_total {
            if total < last {
                return Err(Error::DataQuality(format!(
                    "cpu total decreased: {last} -> {total}"
                )));
            }
        }
        self.last_total = Some(total);
        Ok(total)
    }
}

/// Handle for operating one job through a connected session.
pub struct JobHandle {
    ctx: Arc<Context>,
    job: Job,
    state: JobState,
    ledger: CpuLedger,
    controller: Controller,
    generators: u32,
}

impl JobHandle {
    pub(crate) fn new(ctx: Arc<Context>, job: Job, state: JobState, generators: u32) -> Self {
        let (runners, evaluators) = (
            ctx.config.campaign.runners,
            ctx.config.campaign.evaluators,
        );
        let controller = Controller::new(ctx.config.controller.clone(), runners, evaluators);
        Self {
            ctx,
            job,
            state,
            ledger: CpuLedger::new(),
            controller,
            generators,
        }
    }

    /// The underlying job record.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Collect one statistics snapshot.
    ///
    /// # Errors
    ///
    /// Returns `JobNotActive` unless the job is active. Scrape and
    /// parse failures on individual sources degrade to zero defaults
    /// with an error log; only fatal local errors abort the snapshot.
    pub async fn stats(&self) -> Result<JobStats> {
        if self.state != JobState::Active {
            return Err(Error::JobNotActive {
                name: self.job.name.clone(),
                state: format!("{:?}", self.state),
            });
        }
        let response = self
            .ctx
            .web
            .call(
                &WebRequest::get(self.ctx.view_url(self.job.id)),
                Some("General Information"),
            )
            .await?;
        let view = match parse_view_page(&response.body) {
            Ok(view) => view,
            Err(e) => {
                error!(job = %self.job.name, error = %e, "view page scrape failed");
                ViewStats {
                    completed_testcases: 0,
                    population: 0,
                    access_violations_total: 0,
                    access_violations_unique: 0,
                    crashes_total: 0,
                    crashes_unique: 0,
                    hangs: 0,
                    no_response: 0,
                    covered_blocks: 0,
                    active_pool: 0,
                    active_generators: 0,
                    active_runners: 0,
                    active_evaluators: 0,
                }
            }
        };
        let testcases = self
            .ctx
            .store
            .count_rows(&self.job.db_name, "SELECT COUNT(*) FROM interesting_testcases")
            .await?;
        let paths = self
            .ctx
            .store
            .count_rows(&self.job.db_name, "SELECT COUNT(*) FROM edge_coverage")
            .await?;
        let load = self.worker_number("awk '{ print $1 }' /proc/loadavg").await?;
        let memory_used = self
            .worker_number("free | grep Mem | awk '{print $3/$2 * 100.0}'")
            .await?;
        Ok(JobStats {
            completed_testcases: view.completed_testcases,
            population: view.population,
            access_violations_total: view.access_violations_total,
            access_violations_unique: view.access_violations_unique,
            crashes_total: view.crashes_total,
            crashes_unique: view.crashes_unique,
            hangs: view.hangs,
            no_response: view.no_response,
            covered_blocks: view.covered_blocks,
            active_pool: view.active_pool,
            active_generators: view.active_generators,
            active_runners: view.active_runners,
            active_evaluators: view.active_evaluators,
            testcases,
            paths,
            load,
            memory_used,
        })
    }

    /// Total CPU seconds consumed by this job's agents so far.
    ///
    /// # Errors
    ///
    /// `DataQuality` on unparsable `ps` output or a non-monotone
    /// total; fatal local errors propagate.
    pub async fn cpu_time(&mut self) -> Result<u64> {
        // grep exits nonzero when no agent is running, which is a
        // legitimate empty sample.
        let command = format!(
            "ps -eo pid,time,args | grep -F '{}/' | grep -v grep",
            self.ctx.agent_dir()
        );
        let output = self.ctx.worker.exec(&command, false).await?;
        let mut samples = Vec::new();
        for line in output.stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(pid), Some(time)) = (fields.next(), fields.next()) else {
                continue;
            };
            let pid: u32 = pid
                .parse()
                .map_err(|_| Error::DataQuality(format!("ps pid field: `{pid}`")))?;
            samples.push((pid, parse_cpu_time(time)?));
        }
        self.ledger.observe(&samples)
    }

    /// Push generator/runner/evaluator targets to the control plane
    /// and apply them to the fleet.
    ///
    /// # Errors
    ///
    /// `JobArchived` on an archived handle; otherwise only fatal local
    /// errors propagate.
    pub async fn set_agents(&mut self, generators: u32, runners: u32, evaluators: u32) -> Result<()> {
        if self.state == JobState::Archived {
            return Err(Error::JobArchived {
                name: self.job.name.clone(),
            });
        }
        info!(
            job = %self.job.name,
            generators, runners, evaluators,
            "setting agent targets"
        );
        let arch = &self.ctx.loc.arch;
        let worker = &self.ctx.loc.worker_name;
        let request = WebRequest::post(self.ctx.agent_targets_url(&self.job.name))
            .text(format!("{worker}_tg"), generators.to_string())
            .text(format!("{worker}_tg_arch"), arch.clone())
            .text(format!("{worker}_tr"), runners.to_string())
            .text(format!("{worker}_tr_arch"), arch.clone())
            .text(format!("{worker}_te"), evaluators.to_string())
            .text(format!("{worker}_te_arch"), arch.clone());
        self.ctx.web.call(&request, Some("Success!")).await?;
        self.ctx.apply_agents().await?;
        self.generators = generators;
        self.state = if generators == 0 && runners == 0 && evaluators == 0 {
            JobState::Draining
        } else {
            JobState::Active
        };
        Ok(())
    }

    /// Feed a load sample to the concurrency controller and push any
    /// adjustment it emits. Disabled controllers observe nothing.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_agents`] when an adjustment is pushed.
    pub async fn adjust(&mut self, load: f64) -> Result<Option<Adjustment>> {
        if !self.ctx.config.controller.enabled {
            return Ok(None);
        }
        let Some(adjustment) = self.controller.observe(load, std::time::Instant::now()) else {
            return Ok(None);
        };
        info!(
            job = %self.job.name,
            runners = adjustment.runners,
            evaluators = adjustment.evaluators,
            "load controller adjusting agents"
        );
        self.set_agents(self.generators, adjustment.runners, adjustment.evaluators)
            .await?;
        Ok(Some(adjustment))
    }

    /// Archive the job and wait for the control plane to finish the
    /// archival pipeline.
    ///
    /// # Errors
    ///
    /// `JobArchived` if already archived; otherwise only fatal local
    /// errors propagate.
    pub async fn archive(&mut self) -> Result<()> {
        if self.state == JobState::Archived {
            return Err(Error::JobArchived {
                name: self.job.name.clone(),
            });
        }
        info!(job = %self.job.name, id = self.job.id, "archiving");
        self.ctx
            .web
            .call(
                &WebRequest::post(self.ctx.archive_url(self.job.id)),
                Some("Step 0/4"),
            )
            .await?;
        loop {
            tokio::time::sleep(self.ctx.config.retry.base_delay()).await;
            let progress = self
                .ctx
                .web
                .call(&WebRequest::get(self.ctx.archive_progress_url()), None)
                .await?;
            if progress.body.contains("5/5") {
                break;
            }
            debug!(job = %self.job.name, "archival in progress");
        }
        self.state = JobState::Archived;
        info!(job = %self.job.name, "archived");
        Ok(())
    }

    /// Download the archived database dump from the master, optionally
    /// deleting the remote copy afterwards.
    ///
    /// # Errors
    ///
    /// Only fatal local errors propagate.
    pub async fn fetch_dump(&self, local: &std::path::Path, clean: bool) -> Result<()> {
        let remote = format!(
            "{}/{}.sql.gz",
            self.ctx.config.remote.dump_dir, self.job.db_name
        );
        debug!(job = %self.job.name, remote = %remote, "fetching dump");
        self.ctx.master.get(&remote, local).await?;
        if clean {
            self.ctx.master.exec(&format!("rm {remote}"), true).await?;
        }
        Ok(())
    }

    async fn worker_number(&self, command: &str) -> Result<f64> {
        let output = self.ctx.worker.exec(command, true).await?;
        match output.stdout.trim().parse() {
            Ok(value) => Ok(value),
            Err(_) => {
                error!(
                    job = %self.job.name,
                    command,
                    stdout = %output.stdout,
                    "unparsable worker metric, defaulting to zero"
                );
                Ok(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const VIEW_PAGE: &str = r#"
        <h2>General Information</h2>
        <td style="text-align: center;">123456</td>
        <td style="text-align: center;">642 / 1000</td>
        <td style="text-align: center;">7</td>
        <td style="text-align: center;">3</td>
        <td style="text-align: center;">9</td>
        <td style="text-align: center;">4</td>
        <td style="text-align: center;">2</td>
        <td style="text-align: center;">1</td>
        <td style="text-align: center;">5150</td>
        <td style="text-align: center;">1</td>
        <td style="text-align: center;">ignored</td>
        <td style="text-align: center;">10</td>
        <td style="text-align: center;">11</td>
        <td style="text-align: center;">2</td>
    "#;

    #[test]
    fn test_parse_view_page_fixed_order() {
        let stats = parse_view_page(VIEW_PAGE).expect("parse");
        assert_eq!(stats.completed_testcases, 123_456);
        assert_eq!(stats.population, 642);
        assert_eq!(stats.access_violations_total, 7);
        assert_eq!(stats.access_violations_unique, 3);
        assert_eq!(stats.crashes_total, 9);
        assert_eq!(stats.crashes_unique, 4);
        assert_eq!(stats.hangs, 2);
        assert_eq!(stats.no_response, 1);
        assert_eq!(stats.covered_blocks, 5150);
        assert_eq!(stats.active_pool, 1);
        assert_eq!(stats.active_runners, 10);
        assert_eq!(stats.active_evaluators, 11);
        assert_eq!(stats.active_generators, 2);
    }

    #[test]
    fn test_parse_view_page_missing_agent_cells_default_to_zero() {
        // First ten cells only: the blank line and the heading precede
        // the `<td>` rows in the fixture.
        let truncated: String = VIEW_PAGE.lines().take(12).collect::<Vec<_>>().join("\n");
        let stats = parse_view_page(&truncated).expect("parse");
        assert_eq!(stats.active_runners, 0);
        assert_eq!(stats.active_evaluators, 0);
        assert_eq!(stats.active_generators, 0);
    }

    #[test]
    fn test_parse_view_page_missing_required_cell_is_error() {
        let err = parse_view_page("<td>nothing centered</td>").expect_err("must fail");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_parse_cpu_time_shapes() {
        assert_eq!(parse_cpu_time("03:04").expect("mm:ss"), 184);
        assert_eq!(parse_cpu_time("02:03:04").expect("hh:mm:ss"), 7384);
        assert_eq!(parse_cpu_time("1-02:03:04").expect("dd-hh:mm:ss"), 93_784);
        assert!(parse_cpu_time("garbage").is_err());
        assert!(parse_cpu_time("1:2:3:4").is_err());
    }

    #[test]
    fn test_ledger_counts_dead_processes_exactly_once() {
        let mut ledger = CpuLedger::new();
        assert_eq!(ledger.observe(&[(100, 60)]).expect("first"), 60);
        // PID 100 died, PID 200 started fresh.
        assert_eq!(ledger.observe(&[(200, 10)]).expect("second"), 70);
        // PID 200 keeps running; the dead time is not added again.
        assert_eq!(ledger.observe(&[(200, 25)]).expect("third"), 85);
    }

    #[test]
    fn test_ledger_empty_sample_folds_everything_into_dead() {
        let mut ledger = CpuLedger::new();
        ledger.observe(&[(1, 5), (2, 7)]).expect("first");
        assert_eq!(ledger.observe(&[]).expect("all dead"), 12);
        assert_eq!(ledger.observe(&[]).expect("stable"), 12);
    }

    #[test]
    fn test_ledger_reports_decrease_as_error() {
        let mut ledger = CpuLedger::new();
        ledger.observe(&[(1, 100)]).expect("first");
        // Same PID reporting less time than before.
        let err = ledger.observe(&[(1, 50)]).expect_err("decrease");
        assert!(matches!(err, Error::DataQuality(_)));
    }

    proptest! {
        #[test]
        fn test_ledger_total_is_monotone_over_growing_samples(
            base in 0u64..1000,
            growth in prop::collection::vec(0u64..100, 1..10),
        ) {
            let mut ledger = CpuLedger::new();
            let mut time = base;
            let mut last = 0;
            for step in growth {
                time += step;
                let total = ledger.observe(&[(1, time)]).expect("monotone");
                prop_assert!(total >= last);
                last = total;
            }
        }
    }

    #[test]
    fn test_job_db_name_follows_prefix() {
        let job = Job::new(17, "bench1700000000", "fleet_");
        assert_eq!(job.db_name, "fleet_bench1700000000");
        let listed = Job::with_db(17, "bench1700000000", "fleet_bench1700000000");
        assert_eq!(job, listed);
    }
}
