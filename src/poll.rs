//! 協作式輪詢：以 [`Clock`] 抽象時間，測試可用 [`MockClock`] 模擬等待而不實際睡眠。

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use tracing::debug;

/// 輪詢所使用的時鐘。
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// 真實時間。
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// 虛擬時間：`sleep` 立即返回並把時間往前推。
#[derive(Debug)]
pub struct MockClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += duration;
    }

    /// 從建立至今經過的虛擬時間。
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// 一段輪詢的期限；`timeout` 為 `None` 表示永不逾時。
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    pub fn new(clock: &dyn Clock, timeout: Option<Duration>) -> Self {
        Self {
            start: clock.now(),
            timeout,
        }
    }

    pub fn elapsed(&self, clock: &dyn Clock) -> Duration {
        clock.now().saturating_duration_since(self.start)
    }

    /// 剩餘時間；永不逾時時回傳 `None`。
    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.elapsed(clock)))
    }

    /// 下一次檢查前應等待的時間：`interval` 與剩餘時間取較小者。
    /// 已到期時回傳 `None`。
    pub fn next_wait(&self, clock: &dyn Clock, interval: Duration) -> Option<Duration> {
        match self.remaining(clock) {
            None => Some(interval),
            Some(left) if left.is_zero() => None,
            Some(left) => Some(interval.min(left)),
        }
    }
}

/// 單次檢查的結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// 重複執行 `check`，直到回傳 [`Poll::Ready`] 或逾時。
///
/// 每次未完成的檢查後等待 `interval`（不超過剩餘時間），因此最後一次檢查恰好落在期限上。
/// 逾時回傳 `Ok(None)`；`check` 的錯誤會立即傳回。
pub fn poll_until<T, E>(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Option<Duration>,
    mut check: impl FnMut() -> Result<Poll<T>, E>,
) -> Result<Option<T>, E> {
    let deadline = Deadline::new(clock, timeout);
    loop {
        if let Poll::Ready(value) = check()? {
            return Ok(Some(value));
        }
        match deadline.next_wait(clock, interval) {
            Some(wait) => {
                debug!(?wait, elapsed = ?deadline.elapsed(clock), "Polling again");
                clock.sleep(wait);
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_out_exactly_at_deadline() {
        let clock = MockClock::new();
        let mut checks = Vec::new();

        let result: Result<Option<()>, ()> = poll_until(
            &clock,
            Duration::from_secs(3),
            Some(Duration::from_secs(10)),
            || {
                checks.push(clock.elapsed().as_secs());
                Ok(Poll::Pending)
            },
        );

        assert_eq!(result, Ok(None));
        assert_eq!(checks, vec![0, 3, 6, 9, 10]);
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_ready_value_is_returned() {
        let clock = MockClock::new();
        let mut count = 0;
        let result: Result<Option<u32>, ()> =
            poll_until(&clock, Duration::from_secs(3), None, || {
                count += 1;
                Ok(if count == 4 { Poll::Ready(count) } else { Poll::Pending })
            });

        assert_eq!(result, Ok(Some(4)));
        assert_eq!(clock.elapsed(), Duration::from_secs(9));
    }

    #[test]
    fn test_error_stops_polling() {
        let clock = MockClock::new();
        let result: Result<Option<()>, &str> =
            poll_until(&clock, Duration::from_secs(3), None, || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_zero_timeout_checks_once() {
        let clock = MockClock::new();
        let mut count = 0;
        let result: Result<Option<()>, ()> = poll_until(
            &clock,
            Duration::from_secs(3),
            Some(Duration::ZERO),
            || {
                count += 1;
                Ok(Poll::Pending)
            },
        );
        assert_eq!(result, Ok(None));
        assert_eq!(count, 1);
    }
}
