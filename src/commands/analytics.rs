// ABOUTME: analytics and wait-visible commands, both served by the replica
// ABOUTME: wait-visible polls the lag observer with a caller-chosen policy

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;

use super::print_json;
use crate::lag::{Expectation, PollPolicy};
use crate::models::DateRange;
use crate::service::SalesStore;
use crate::store::Connector;

/// Stats, top products and daily trend over the last `days` days.
pub async fn analytics<C: Connector>(store: &SalesStore<C>, days: u32) -> Result<()> {
    let range = if days == 0 {
        DateRange::all()
    } else {
        DateRange::last_days(days, Utc::now().naive_utc())
    };
    let summary = store
        .get_analytics(&range)
        .await
        .context("Failed to compute analytics")?;
    print_json(&summary)
}

#[derive(Args, Debug)]
pub struct WaitArgs {
    pub transaction_id: i64,
    /// Wait for the transaction to disappear (after a delete)
    #[arg(long)]
    pub absent: bool,
    /// Milliseconds between probes
    #[arg(long, default_value_t = 500)]
    pub interval_ms: u64,
    /// Probes before giving up
    #[arg(long, default_value_t = 20)]
    pub attempts: u32,
}

impl WaitArgs {
    fn expectation(&self) -> Expectation {
        if self.absent {
            Expectation::Absent
        } else {
            Expectation::Present
        }
    }

    fn policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.interval_ms),
            max_attempts: self.attempts,
        }
    }
}

/// Poll the replica until a write is reflected there. Giving up is not an
/// error; the report says whether the state was reached.
pub async fn wait_visible<C: Connector>(store: &SalesStore<C>, args: WaitArgs) -> Result<()> {
    let report = store
        .wait_until(args.transaction_id, args.expectation(), args.policy())
        .await
        .context("Failed to probe replica")?;
    print_json(&report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_args_policy() {
        let args = WaitArgs {
            transaction_id: 3,
            absent: true,
            interval_ms: 50,
            attempts: 4,
        };
        assert_eq!(args.expectation(), Expectation::Absent);
        assert_eq!(
            args.policy(),
            PollPolicy {
                interval: Duration::from_millis(50),
                max_attempts: 4
            }
        );
    }
}
