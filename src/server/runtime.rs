/// Size the tokio worker pool from the container CPU allowance rather than
/// the host CPU count. Both cgroup versions express the allowance as a
/// quota/period pair (v2 keeps the pair in one file, v1 splits it across
/// two), so one parser serves both. Runs before tracing is initialized,
/// hence the `eprintln!`.
///
/// `SQLTUNNEL_WORKER_THREADS` overrides detection with an exact thread
/// count. Fractional allowances round up, so a half-core container still
/// gets a worker, and the result never exceeds the host parallelism.
pub fn worker_threads() -> usize {
    if let Ok(raw) = std::env::var("SQLTUNNEL_WORKER_THREADS") {
        match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => return n,
            _ => eprintln!(
                "[runtime] ignoring invalid SQLTUNNEL_WORKER_THREADS={:?}",
                raw
            ),
        }
    }

    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    match cgroup_cpu_allowance() {
        Some(cores) => cores.clamp(1, host),
        None => host,
    }
}

/// CPU allowance from the cgroup hierarchy, in whole cores. `None` when
/// nothing is mounted or no limit applies.
fn cgroup_cpu_allowance() -> Option<usize> {
    let read = |path: &str| std::fs::read_to_string(path).ok();

    let (quota, period) = read("/sys/fs/cgroup/cpu.max")
        .and_then(|max| {
            let mut fields = max.split_whitespace().map(str::to_string);
            Some((fields.next()?, fields.next()?))
        })
        .or_else(|| {
            Some((
                read("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?,
                read("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?,
            ))
        })?;

    cores_from_quota(&quota, &period)
}

/// Whole cores granted by a quota/period pair, rounded up. Unlimited
/// markers ("max" in v2, "-1" in v1) fail the unsigned parse and fall out
/// as `None`.
fn cores_from_quota(quota: &str, period: &str) -> Option<usize> {
    let quota: u64 = quota.trim().parse().ok()?;
    let period: u64 = period.trim().parse().ok()?;
    if quota == 0 || period == 0 {
        return None;
    }
    Some(quota.div_ceil(period) as usize)
}

/// Every proxied connection burns two file descriptors, so the default soft
/// NOFILE limit runs out fast. Raise it to the hard limit; when privileged,
/// try to push both limits up first.
pub fn raise_nofile_limit() {
    const WANT: u64 = 65_536;

    let (soft, hard) = match rlimit::Resource::NOFILE.get() {
        Ok(limits) => limits,
        Err(e) => {
            tracing::warn!("runtime: couldn't read NOFILE limit: {}", e);
            return;
        }
    };

    if hard < WANT && rlimit::Resource::NOFILE.set(WANT, WANT).is_ok() {
        tracing::info!("runtime: raised NOFILE limit to {}", WANT);
        return;
    }
    if soft < hard {
        match rlimit::Resource::NOFILE.set(hard, hard) {
            Ok(()) => tracing::info!("runtime: raised NOFILE soft limit {} -> {}", soft, hard),
            Err(e) => tracing::warn!("runtime: couldn't raise NOFILE limit: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_core_quotas() {
        assert_eq!(cores_from_quota("400000", "100000"), Some(4));
        assert_eq!(cores_from_quota("100000", "100000"), Some(1));
    }

    #[test]
    fn fractional_quotas_round_up() {
        assert_eq!(cores_from_quota("50000", "100000"), Some(1));
        assert_eq!(cores_from_quota("150000", "100000"), Some(2));
    }

    #[test]
    fn unlimited_and_degenerate_pairs_mean_no_limit() {
        assert_eq!(cores_from_quota("max", "100000"), None);
        assert_eq!(cores_from_quota("-1", "100000"), None);
        assert_eq!(cores_from_quota("0", "100000"), None);
        assert_eq!(cores_from_quota("100000", "0"), None);
        assert_eq!(cores_from_quota("", ""), None);
    }

    #[test]
    fn worker_count_is_at_least_one() {
        assert!(worker_threads() >= 1);
    }
}
