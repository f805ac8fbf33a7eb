use podscale_common::config::Config;

/// Everything the reconciler needs to decide a scale delta. Plain data, no
/// I/O — this is what makes the decision function exhaustively unit
/// testable without any store/provider fakes.
#[derive(Clone, Copy, Debug)]
pub struct ReconcilerInput {
    pub n_active: u32,
    pub n_spawning: u32,
    pub demand: u32,
    pub busy_workers: u32,
    pub failure_rate: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilerDecision {
    pub desired: u32,
    pub delta: i32,
    pub scale_up_blocked: Option<&'static str>,
}

/// Computes the scale delta for one cycle. Victim selection for `delta < 0`
/// is left to the actuator; this function only decides the magnitude.
pub fn reconcile(input: ReconcilerInput, cfg: &Config) -> ReconcilerDecision {
    // Step 1: desired from demand.
    let mut d_demand = div_ceil(input.demand, cfg.tasks_per_gpu_threshold);
    if input.demand > 0 && d_demand == 0 {
        d_demand = 1;
    }

    // Step 2: desired from busy workers.
    let d_busy = input.busy_workers + cfg.idle_buffer;

    // Step 3: raw desired.
    let floor = if input.demand > 0 || !cfg.allow_zero_floor {
        cfg.min_active_gpus
    } else {
        0
    };
    let d_raw = floor.max(d_demand).max(d_busy);

    // Step 4: clamp.
    let mut desired = d_raw.min(cfg.max_active_gpus);
    let capped_by_ceiling = d_raw > cfg.max_active_gpus;

    // Step 5: current capacity.
    let c = input.n_active + input.n_spawning;

    // Step 6: raw delta.
    let mut delta = desired as i32 - c as i32;
    let mut scale_up_blocked = None;

    // Step 7: failure-rate interlock (scale-up only).
    if delta > 0 {
        if let Some(rate) = input.failure_rate {
            if rate > cfg.failure_rate_ceiling {
                delta = 0;
                scale_up_blocked = Some("failure_rate");
            }
        }
    }
    if capped_by_ceiling && scale_up_blocked.is_none() {
        scale_up_blocked = Some("max_cap");
    }

    // Step 8: minimum-floor bias when demand is zero — scale down idle
    // workers one at a time, never below the floor unless the floor is 0.
    if input.demand == 0 && c > cfg.min_active_gpus {
        let idle = input.n_active.saturating_sub(input.busy_workers);
        if idle > 0 {
            let floor_for_bias = if cfg.allow_zero_floor { 0 } else { cfg.min_active_gpus };
            let max_reduction = -((c as i32) - floor_for_bias as i32);
            let idle_bound = -(idle as i32);
            delta = delta.min(0).max(max_reduction).max(idle_bound);
            desired = (c as i32 + delta).max(0) as u32;
        }
    }

    ReconcilerDecision {
        desired,
        delta,
        scale_up_blocked,
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    if b == 0 {
        return 0;
    }
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut c = Config::from_env();
        c.min_active_gpus = 1;
        c.max_active_gpus = 10;
        c.tasks_per_gpu_threshold = 3;
        c.idle_buffer = 0;
        c.allow_zero_floor = true;
        c.failure_rate_ceiling = 0.80;
        c
    }

    #[test]
    fn cold_start_demand_zero_spawns_floor() {
        let mut config = cfg();
        config.allow_zero_floor = false;
        let input = ReconcilerInput {
            n_active: 0,
            n_spawning: 0,
            demand: 0,
            busy_workers: 0,
            failure_rate: None,
        };
        let decision = reconcile(input, &config);
        assert_eq!(decision.delta, 1);
        assert_eq!(decision.desired, 1);
    }

    #[test]
    fn demand_burst_scales_up_to_match() {
        // S2: 1 active idle, demand=15, threshold=3, max=10 => d_demand=5, delta=+4
        let input = ReconcilerInput {
            n_active: 1,
            n_spawning: 0,
            demand: 15,
            busy_workers: 0,
            failure_rate: None,
        };
        let decision = reconcile(input, &cfg());
        assert_eq!(decision.desired, 5);
        assert_eq!(decision.delta, 4);
        assert_eq!(decision.scale_up_blocked, None);
    }

    #[test]
    fn failure_rate_interlock_blocks_scale_up_only() {
        // S3: failure_rate=0.875 > 0.80, demand=20
        let input = ReconcilerInput {
            n_active: 1,
            n_spawning: 0,
            demand: 20,
            busy_workers: 1,
            failure_rate: Some(0.875),
        };
        let decision = reconcile(input, &cfg());
        assert_eq!(decision.delta, 0);
        assert_eq!(decision.scale_up_blocked, Some("failure_rate"));
    }

    #[test]
    fn failure_rate_interlock_never_blocks_scale_down() {
        let mut config = cfg();
        config.min_active_gpus = 0;
        let input = ReconcilerInput {
            n_active: 5,
            n_spawning: 0,
            demand: 0,
            busy_workers: 0,
            failure_rate: Some(0.95),
        };
        let decision = reconcile(input, &config);
        assert!(decision.delta < 0);
    }

    #[test]
    fn max_cap_blocks_scale_up_and_is_recorded() {
        let mut config = cfg();
        config.max_active_gpus = 2;
        let input = ReconcilerInput {
            n_active: 2,
            n_spawning: 0,
            demand: 30,
            busy_workers: 2,
            failure_rate: None,
        };
        let decision = reconcile(input, &config);
        assert_eq!(decision.delta, 0);
        assert_eq!(decision.scale_up_blocked, Some("max_cap"));
    }

    #[test]
    fn zero_demand_scales_down_idle_worker_one_at_a_time() {
        let input = ReconcilerInput {
            n_active: 3,
            n_spawning: 0,
            demand: 0,
            busy_workers: 1,
            failure_rate: None,
        };
        let decision = reconcile(input, &cfg());
        // 2 idle workers available, floor is 1 (allow_zero_floor lets us go to 0,
        // but the per-cycle bias only removes what's idle this cycle).
        assert!(decision.delta < 0);
        assert!(decision.delta >= -2);
    }

    #[test]
    fn zero_demand_respects_floor_when_not_allow_zero() {
        let mut config = cfg();
        config.allow_zero_floor = false;
        config.min_active_gpus = 2;
        let input = ReconcilerInput {
            n_active: 3,
            n_spawning: 0,
            demand: 0,
            busy_workers: 0,
            failure_rate: None,
        };
        let decision = reconcile(input, &config);
        assert_eq!(decision.desired, 2);
    }

    #[test]
    fn never_preempts_below_busy_count_via_bias() {
        let input = ReconcilerInput {
            n_active: 2,
            n_spawning: 0,
            demand: 0,
            busy_workers: 2,
            failure_rate: None,
        };
        let decision = reconcile(input, &cfg());
        // All workers busy, no idle candidates: the bias step should not fire.
        assert_eq!(decision.delta, 0);
    }
}
