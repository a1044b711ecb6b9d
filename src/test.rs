#[cfg(test)]
mod tests {
    use crate::error::PipeError;
    use crate::{
        blocked, enter_scope, exit_scope, kill_all, killed, open, select, send, sync,
        truncate_all, truncated,
    };
    use rand::Rng;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn sum_interval(start: u64, count: u64) -> u64 {
        (start..start + count).sum()
    }

    // ---- flat pool: sum [0, LAST) across randomly sized workers

    #[test]
    fn flat_pool_sums_intervals() {
        const LAST: u64 = 10_000;
        let mut rng = rand::thread_rng();
        let mut start = 0u64;
        let mut opened = 0usize;
        while start < LAST {
            let count = rng.gen_range(1..=1_000u64).min(LAST - start);
            let s = start;
            open(move || Ok(sum_interval(s, count))).expect("open worker");
            start += count;
            opened += 1;
        }
        let mut total = 0u64;
        let mut read = 0usize;
        while let Some(p) = select().expect("select") {
            total += p.read_as::<u64>().expect("read");
            read += 1;
        }
        assert_eq!(read, opened);
        assert_eq!(total, LAST * (LAST - 1) / 2);
    }

    // ---- deep pool: recursive divide-and-conquer summation

    fn conquer(start: u64, count: u64) -> Result<u64, PipeError> {
        if count <= 1_000 {
            return Ok(sum_interval(start, count));
        }
        let half = count / 2;
        let left = open(move || conquer(start, half))?;
        let right = open(move || conquer(start + half, count - half))?;
        Ok(left.read_as::<u64>()? + right.read_as::<u64>()?)
    }

    #[test]
    fn deep_pool_divides_and_conquers() {
        const LAST: u64 = 20_000;
        let root = open(move || conquer(0, LAST)).expect("open root");
        assert_eq!(
            root.read_as::<u64>().expect("read root"),
            LAST * (LAST - 1) / 2
        );
    }

    // ---- truncation: partial sums plus recorded omissions stay exact

    #[test]
    fn truncation_accounts_for_omissions() {
        const WORKERS: u64 = 8;
        const N: u64 = 200;
        let omitted = Arc::new(Mutex::new(0u64));
        let mut pipes = Vec::new();
        for w in 0..WORKERS {
            let omitted = omitted.clone();
            let p = open(move || {
                let mut sum = 0u64;
                for i in (w * N)..((w + 1) * N) {
                    if truncated()? > 0 {
                        let rest: u64 = (i..(w + 1) * N).sum();
                        *omitted.lock().unwrap() += rest;
                        return Ok(sum);
                    }
                    sum += i;
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(sum)
            })
            .expect("open worker");
            pipes.push(p);
        }
        thread::sleep(Duration::from_millis(20));
        truncate_all().expect("truncate all");
        let mut total = 0u64;
        for p in &pipes {
            total += p.read_as::<u64>().expect("read");
        }
        let expected: u64 = (0..WORKERS * N).sum();
        assert_eq!(total + *omitted.lock().unwrap(), expected);
    }

    #[test]
    fn truncate_reaches_a_single_worker() {
        let p = open(|| {
            while truncated()? == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            truncated()
        })
        .expect("open worker");
        p.truncate().expect("truncate");
        assert!(p.read_as::<u32>().expect("read") >= 1);
    }

    // ---- kill: cooperative cancellation of roughly half the siblings

    #[test]
    fn kill_roughly_half() {
        let mut rng = rand::thread_rng();
        let mut kept = 0usize;
        for i in 0..16u64 {
            let p = open(move || {
                for _ in 0..400 {
                    if killed()? {
                        return Ok(0u64);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(i + 1)
            })
            .expect("open worker");
            if rng.gen_bool(0.5) {
                p.kill().expect("kill");
            } else {
                kept += 1;
            }
        }
        let mut seen = 0usize;
        while let Some(p) = select().expect("select") {
            assert!(p.read_as::<u64>().expect("read") > 0);
            seen += 1;
        }
        assert_eq!(seen, kept);
    }

    #[test]
    fn select_interrupted_by_kill() {
        let observed: Arc<Mutex<Option<Result<bool, PipeError>>>> = Arc::new(Mutex::new(None));
        let obs = observed.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let a = open(move || {
            let _child = open(|| {
                for _ in 0..10_000 {
                    if killed()? {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(0u64)
            })?;
            ready_tx.send(()).ok();
            let verdict = select().map(|o| o.is_some());
            *obs.lock().unwrap() = Some(verdict);
            Ok(1u64)
        })
        .expect("open");
        ready_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("worker is selecting");
        thread::sleep(Duration::from_millis(10));
        a.kill().expect("kill");
        sync().expect("sync");
        assert_eq!(*observed.lock().unwrap(), Some(Err(PipeError::Killed)));
    }

    // ---- scopes: pipes are selectable only at the level they were opened

    #[test]
    fn scope_isolation() {
        const SCOPES: usize = 3;
        const CONCURRENCY: usize = 4;
        for s in 0..SCOPES {
            for _ in 0..CONCURRENCY {
                let tag = s;
                open(move || {
                    thread::sleep(Duration::from_millis(5 * tag as u64));
                    Ok(tag)
                })
                .expect("open worker");
            }
            enter_scope().expect("enter scope");
        }
        let mut total = 0usize;
        for s in (0..SCOPES).rev() {
            exit_scope().expect("exit scope");
            let mut local = 0usize;
            while let Some(p) = select().expect("select") {
                assert_eq!(p.read_as::<usize>().expect("read"), s);
                local += 1;
            }
            assert_eq!(local, CONCURRENCY);
            total += local;
        }
        assert_eq!(total, SCOPES * CONCURRENCY);
    }

    #[test]
    fn exit_scope_orphans_live_descendants() {
        enter_scope().expect("enter");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let p = open(move || {
            gate_rx.recv().ok();
            Ok(7u64)
        })
        .expect("open");
        exit_scope().expect("exit");
        // the worker is an untethered root now; this scope has nothing to
        // wait for
        assert!(select().expect("select").is_none());
        gate_tx.send(()).unwrap();
        p.tether().expect("tether");
        assert_eq!(p.read_as::<u64>().expect("read"), 7);
    }

    #[test]
    fn exit_scope_without_enter_underflows() {
        // establish a context first so underflow is the failure, not the
        // absence of one
        let p = open(|| Ok(0u64)).expect("open");
        p.read_as::<u64>().expect("read");
        assert_eq!(exit_scope(), Err(PipeError::ScopeUnderflow));
    }

    // ---- send: fire-and-forget workers finish before sync returns

    #[test]
    fn send_completes_before_sync_returns() {
        let resource = Arc::new(Mutex::new(true));
        let observed = Arc::new(Mutex::new(false));
        let (r, o) = (resource.clone(), observed.clone());
        send(move || {
            thread::sleep(Duration::from_millis(150));
            let still_set = *r.lock().unwrap();
            *o.lock().unwrap() = still_set;
        })
        .expect("send");
        sync().expect("sync");
        *resource.lock().unwrap() = false;
        assert!(*observed.lock().unwrap());
    }

    // ---- unmanaged reader: a foreign thread can read an untethered pipe

    #[test]
    fn unmanaged_thread_reads_untethered_pipe() {
        let p = open(|| Ok(42u64)).expect("open");
        p.untether().expect("untether");
        let h = thread::spawn(move || p.read_as::<u64>().expect("read from unmanaged thread"));
        assert_eq!(h.join().unwrap(), 42);
    }

    // ---- boundaries

    #[test]
    fn second_read_is_detected() {
        let p = open(|| Ok(5u64)).expect("open");
        assert_eq!(p.read_as::<u64>().expect("first read"), 5);
        assert_eq!(p.read().unwrap_err(), PipeError::InvalidPipe);
    }

    #[test]
    fn open_fails_under_killed_drain() {
        let (tx, rx) = mpsc::channel::<Result<(), PipeError>>();
        let a = open(move || {
            for _ in 0..10_000 {
                if killed()? {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            tx.send(open(|| Ok(0u64)).map(|_| ())).ok();
            Ok(0u64)
        })
        .expect("open");
        thread::sleep(Duration::from_millis(20));
        a.kill().expect("kill");
        let outcome = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("worker reported");
        assert_eq!(outcome, Err(PipeError::Killed));
    }

    #[test]
    fn read_by_third_thread_is_not_drain() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let p = open(move || {
            gate_rx.recv().ok();
            Ok(1u64)
        })
        .expect("open");
        let h = thread::spawn(move || {
            let own = open(|| Ok(0u64)).expect("open own");
            let verdict = p.read().map(|_| ());
            own.read_as::<u64>().expect("own read");
            (verdict, p)
        });
        let (verdict, p) = h.join().unwrap();
        assert_eq!(verdict.unwrap_err(), PipeError::NotDrain);
        gate_tx.send(()).unwrap();
        assert_eq!(p.read_as::<u64>().expect("read by real drain"), 1);
    }

    #[test]
    fn untether_tether_round_trip() {
        let p = open(|| {
            thread::sleep(Duration::from_millis(30));
            Ok(9u64)
        })
        .expect("open");
        p.untether().expect("untether");
        p.tether().expect("tether");
        assert_eq!(p.read_as::<u64>().expect("read"), 9);
    }

    #[test]
    fn kill_all_is_idempotent() {
        for i in 0..4u64 {
            open(move || {
                for _ in 0..10_000 {
                    if killed()? {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(i)
            })
            .expect("open worker");
        }
        kill_all().expect("first kill_all");
        kill_all().expect("second kill_all");
        assert!(select().expect("select").is_none());
    }

    #[test]
    fn busy_and_blocked_reflect_pending_work() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let p = open(move || {
            gate_rx.recv().ok();
            Ok(3u64)
        })
        .expect("open");
        assert!(p.busy().expect("busy"));
        assert!(blocked().expect("blocked"));
        gate_tx.send(()).unwrap();
        assert_eq!(p.read_as::<u64>().expect("read"), 3);
        assert!(!blocked().expect("after read"));
    }

    #[test]
    fn worker_error_becomes_read_error() {
        let p = open(|| -> Result<u64, PipeError> { Err(PipeError::Os(libc::EDOM)) })
            .expect("open");
        assert_eq!(p.read().unwrap_err(), PipeError::Os(libc::EDOM));
    }

    #[test]
    fn worker_panic_is_contained() {
        let p = open(|| -> Result<u64, PipeError> { panic!("deliberate") }).expect("open");
        assert_eq!(p.read().unwrap_err(), PipeError::Panicked);
    }
}
