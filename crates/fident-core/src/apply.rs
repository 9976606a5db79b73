use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::policy::StreamRule;
use crate::record::{Status, FILEHANDLER};

pub const NOTINPOLICIES: &str = "file format is not in policies. running strict mode: file removed";
pub const SKIPPED: &str = "file format is not in policies, skipped";

impl Pipeline<'_> {
    /// Decide per discovered record: accept, queue for conversion, or
    /// quarantine in strict mode.
    pub fn apply_policies(&mut self) -> Result<()> {
        let candidates: Vec<usize> = (0..self.records.len())
            .filter(|&i| self.records[i].status == Status::Discovered && self.records[i].is_active())
            .collect();
        info!(files = candidates.len(), "applying policies");

        let total = candidates.len() as u64;
        for (n, idx) in candidates.into_iter().enumerate() {
            self.check_cancelled()?;
            self.progress.report("apply", n as u64, total, "Applying policies");
            self.apply_policy(idx)?;
        }
        Ok(())
    }

    fn apply_policy(&mut self, idx: usize) -> Result<()> {
        let Some(format) = self.records[idx].resolved_format.clone() else {
            return Ok(());
        };
        let Some(policy) = self.policies.get(&format) else {
            if self.settings.strict {
                if self.quarantine(idx)? {
                    self.records[idx].log(FILEHANDLER, NOTINPOLICIES);
                }
            } else {
                self.records[idx].log_once(FILEHANDLER, SKIPPED);
            }
            return Ok(());
        };

        if !policy.accepted {
            return self.records[idx].transition(Status::Pending);
        }
        if let Some(rule) = policy.effective_stream_rule(&format) {
            if !self.streams_conform(idx, &rule) {
                return self.records[idx].transition(Status::Pending);
            }
        }
        self.records[idx].transition(Status::Added)
    }

    /// Probe stream codecs against a container rule. A file whose streams
    /// cannot be listed is left as accepted.
    fn streams_conform(&mut self, idx: usize, rule: &StreamRule) -> bool {
        let record = &mut self.records[idx];
        let streams = match self.tools.probe.streams(&record.absolute_path) {
            Ok(Some(streams)) if !streams.is_empty() => streams,
            Ok(_) => {
                warn!(path = %record.relative_path.display(), "throwing errors. consider inspection");
                return true;
            }
            Err(e) => {
                warn!(path = %record.relative_path.display(), "cannot list streams: {e}. consider inspection");
                return true;
            }
        };

        if rule.is_satisfied_by(streams.iter().map(|s| s.codec_name.as_str())) {
            return true;
        }
        let codecs: Vec<&str> = streams.iter().map(|s| s.codec_name.as_str()).collect();
        record.log(
            FILEHANDLER,
            format!("streams {codecs:?} do not match {:?} of {:?}", rule.mode, rule.codecs),
        );
        false
    }
}
