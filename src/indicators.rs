//! Technical indicators - stateful computations over price series.
//!
//! Each indicator maintains its own state and can be updated incrementally.
//! Seeding follows the usual reference conventions: EMAs start from the SMA
//! of their first `period` inputs, RSI/ATR/ADX use Wilder smoothing seeded
//! the same way, and an indicator yields `None` until it is seeded.
//!
//! [`IndicatorWindow`] owns the bounded per-asset history and replays it
//! through fresh indicators to produce a snapshot, so values always describe
//! exactly the retained window.

use std::collections::VecDeque;

// =============================================================================
// Smoothing primitives
// =============================================================================

/// Exponential moving average, SMA-seeded.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    alpha: f64,
    seed_sum: f64,
    count: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self { period, alpha: 2.0 / (period as f64 + 1.0), seed_sum: 0.0, count: 0, value: None }
    }

    pub fn update(&mut self, x: f64) -> Option<f64> {
        self.count += 1;
        match self.value {
            Some(prev) => self.value = Some(prev + self.alpha * (x - prev)),
            None => {
                self.seed_sum += x;
                if self.count == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        self.value
    }

    pub fn get(&self) -> Option<f64> {
        self.value
    }
}

/// Wilder's running average: SMA seed, then `(prev * (n - 1) + x) / n`.
#[derive(Debug, Clone)]
pub struct Wilder {
    period: usize,
    seed_sum: f64,
    count: usize,
    value: Option<f64>,
}

impl Wilder {
    pub fn new(period: usize) -> Self {
        Self { period: period.max(1), seed_sum: 0.0, count: 0, value: None }
    }

    pub fn update(&mut self, x: f64) -> Option<f64> {
        self.count += 1;
        let n = self.period as f64;
        match self.value {
            Some(prev) => self.value = Some((prev * (n - 1.0) + x) / n),
            None => {
                self.seed_sum += x;
                if self.count == self.period {
                    self.value = Some(self.seed_sum / n);
                }
            }
        }
        self.value
    }

    pub fn get(&self) -> Option<f64> {
        self.value
    }
}

/// Simple moving average with fixed window
#[derive(Debug, Clone)]
pub struct Sma {
    window: VecDeque<f64>,
    period: usize,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self { window: VecDeque::with_capacity(period), period, sum: 0.0 }
    }

    pub fn update(&mut self, x: f64) -> Option<f64> {
        self.sum += x;
        self.window.push_back(x);
        if self.window.len() > self.period {
            self.sum -= self.window.pop_front().unwrap_or(0.0);
        }
        self.get()
    }

    pub fn get(&self) -> Option<f64> {
        if self.is_ready() {
            Some(self.sum / self.period as f64)
        } else {
            None
        }
    }

    /// Mean of whatever has been seen so far, full window or not.
    pub fn partial(&self) -> Option<f64> {
        if self.window.is_empty() {
            None
        } else {
            Some(self.sum / self.window.len() as f64)
        }
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }
}

// =============================================================================
// Classic Technical Indicators
// =============================================================================

/// Relative Strength Index (RSI), Wilder smoothing.
#[derive(Debug, Clone)]
pub struct Rsi {
    gain: Wilder,
    loss: Wilder,
    prev: Option<f64>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self { gain: Wilder::new(period), loss: Wilder::new(period), prev: None }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        if let Some(prev) = self.prev {
            let change = price - prev;
            self.gain.update(change.max(0.0));
            self.loss.update((-change).max(0.0));
        }
        self.prev = Some(price);
        self.get()
    }

    pub fn get(&self) -> Option<f64> {
        let (g, l) = (self.gain.get()?, self.loss.get()?);
        Some(if l == 0.0 {
            if g == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + g / l)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub macd: f64,
    /// `None` until `signal_period` MACD values exist.
    pub signal: Option<f64>,
}

impl MacdValue {
    pub fn histogram(&self) -> Option<f64> {
        self.signal.map(|s| self.macd - s)
    }

    /// macd - signal, zero while the signal line is unseeded.
    pub fn diff(&self) -> f64 {
        self.histogram().unwrap_or(0.0)
    }
}

/// MACD (Moving Average Convergence Divergence)
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
    value: Option<MacdValue>,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self { fast: Ema::new(fast), slow: Ema::new(slow), signal: Ema::new(signal), value: None }
    }

    pub fn default_12_26_9() -> Self {
        Self::new(12, 26, 9)
    }

    pub fn update(&mut self, price: f64) -> Option<MacdValue> {
        let fast = self.fast.update(price);
        let slow = self.slow.update(price);
        if let (Some(f), Some(s)) = (fast, slow) {
            let macd = f - s;
            let signal = self.signal.update(macd);
            self.value = Some(MacdValue { macd, signal });
        }
        self.value
    }

    pub fn get(&self) -> Option<MacdValue> {
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl Bands {
    /// Signed position around the middle, in half-widths, clamped to [-1, 1].
    pub fn position(&self, price: f64) -> f64 {
        let half = ((self.upper - self.lower) / 2.0).max(1e-9);
        ((price - self.middle) / half).clamp(-1.0, 1.0)
    }
}

/// Bollinger Bands over a population standard deviation.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    period: usize,
    multiplier: f64,
    window: VecDeque<f64>,
}

impl BollingerBands {
    pub fn new(period: usize, multiplier: f64) -> Self {
        let period = period.max(1);
        Self { period, multiplier, window: VecDeque::with_capacity(period) }
    }

    pub fn default_20_2() -> Self {
        Self::new(20, 2.0)
    }

    pub fn update(&mut self, price: f64) -> Option<Bands> {
        self.window.push_back(price);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        self.get()
    }

    pub fn get(&self) -> Option<Bands> {
        if self.window.len() < self.period {
            return None;
        }
        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let var = self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let width = var.sqrt() * self.multiplier;
        Some(Bands { upper: mean + width, middle: mean, lower: mean - width })
    }
}

fn true_range(high: f64, low: f64, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
        None => high - low,
    }
}

/// Average True Range (ATR), Wilder smoothing.
#[derive(Debug, Clone)]
pub struct Atr {
    smooth: Wilder,
    prev_close: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self { smooth: Wilder::new(period), prev_close: None }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let tr = true_range(high, low, self.prev_close);
        self.prev_close = Some(close);
        self.smooth.update(tr)
    }

    pub fn get(&self) -> Option<f64> {
        self.smooth.get()
    }
}

/// Average Directional Index (ADX).
#[derive(Debug, Clone)]
pub struct Adx {
    plus_dm: Wilder,
    minus_dm: Wilder,
    tr: Wilder,
    dx: Wilder,
    prev: Option<(f64, f64, f64)>,
}

impl Adx {
    pub fn new(period: usize) -> Self {
        Self {
            plus_dm: Wilder::new(period),
            minus_dm: Wilder::new(period),
            tr: Wilder::new(period),
            dx: Wilder::new(period),
            prev: None,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        if let Some((ph, pl, pc)) = self.prev {
            let up = high - ph;
            let down = pl - low;
            let pdm = if up > down && up > 0.0 { up } else { 0.0 };
            let mdm = if down > up && down > 0.0 { down } else { 0.0 };
            let sp = self.plus_dm.update(pdm);
            let sm = self.minus_dm.update(mdm);
            let st = self.tr.update(true_range(high, low, Some(pc)));
            if let (Some(sp), Some(sm), Some(st)) = (sp, sm, st) {
                let (pdi, mdi) = if st > 0.0 { (100.0 * sp / st, 100.0 * sm / st) } else { (0.0, 0.0) };
                let sum = pdi + mdi;
                let dx = if sum > 0.0 { 100.0 * (pdi - mdi).abs() / sum } else { 0.0 };
                self.dx.update(dx);
            }
        }
        self.prev = Some((high, low, close));
        self.get()
    }

    pub fn get(&self) -> Option<f64> {
        self.dx.get()
    }
}

// =============================================================================
// Window statistics
// =============================================================================

/// z-score of the last value against the population σ of `values`;
/// σ = 0 is treated as 1.
pub fn volume_zscore(values: &[f64]) -> f64 {
    let Some(&last) = values.last() else {
        return 0.0;
    };
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sd = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    (last - mean) / if sd == 0.0 { 1.0 } else { sd }
}

/// Cumulative typical-price VWAP; `None` when no volume traded.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    let (pv, vol) = candles.iter().fold((0.0, 0.0), |(pv, vol), c| {
        let v = c.volume.unwrap_or(0.0);
        (pv + c.typical() * v, vol + v)
    });
    if vol > 0.0 {
        Some(pv / vol)
    } else {
        None
    }
}

/// Choppiness index from the last `period` ATR values and the high/low range
/// of the last `period` candles, clamped to [0, 100] and rounded to two
/// decimals. 50 when history is short, the range is flat, the ATR sum is not
/// positive, or the value is not finite.
pub fn choppiness(atr_values: &[f64], candles: &[Candle], period: usize) -> f64 {
    const NEUTRAL: f64 = 50.0;
    if candles.len() < period || period < 2 {
        return NEUTRAL;
    }
    let tail = &candles[candles.len() - period..];
    let sum_atr: f64 = atr_values.iter().rev().take(period).sum();
    let high = tail.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = tail.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let range = high - low;
    if range <= f64::EPSILON || sum_atr <= 0.0 {
        return NEUTRAL;
    }
    let ci = 100.0 * (sum_atr / range).log10() / (period as f64).log10();
    if !ci.is_finite() {
        return NEUTRAL;
    }
    (ci.clamp(0.0, 100.0) * 100.0).round() / 100.0
}

// =============================================================================
// Per-asset window
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

impl Candle {
    pub fn typical(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Indicator values for ensemble scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSnapshot {
    pub price: f64,
    pub rsi14: f64,
    pub macd: MacdValue,
    pub bands: Bands,
    pub ema9: f64,
    pub ema21: f64,
    pub ema12: f64,
    pub ema26: f64,
    pub vwap: Option<f64>,
    pub volume: f64,
    pub volume_z: f64,
}

/// Indicator values for trend/regime classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendSnapshot {
    pub sma_short: f64,
    pub sma_long: f64,
    pub macd: MacdValue,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    pub choppiness: f64,
}

/// Bounded FIFO of recent candles for one asset.
#[derive(Debug, Clone)]
pub struct IndicatorWindow {
    cap: usize,
    candles: VecDeque<Candle>,
}

impl IndicatorWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { cap, candles: VecDeque::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.candles.back().map(|c| c.close)
    }

    pub fn push(&mut self, candle: Candle) {
        self.candles.push_back(candle);
        while self.candles.len() > self.cap {
            self.candles.pop_front();
        }
    }

    /// Append a tick, filling missing high/low from the close and the
    /// previous close.
    pub fn push_tick(&mut self, close: f64, high: Option<f64>, low: Option<f64>, volume: Option<f64>) {
        let prev = self.last_close().unwrap_or(close);
        self.push(Candle {
            high: high.unwrap_or_else(|| close.max(prev)),
            low: low.unwrap_or_else(|| close.min(prev)),
            close,
            volume,
        });
    }

    fn contiguous(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    pub fn signal_snapshot(&self, min_history: usize) -> Option<SignalSnapshot> {
        if self.len() < min_history.max(1) {
            return None;
        }
        let candles = self.contiguous();
        let mut rsi = Rsi::new(14);
        let mut macd = Macd::default_12_26_9();
        let mut bb = BollingerBands::default_20_2();
        let (mut e9, mut e21, mut e12, mut e26) = (Ema::new(9), Ema::new(21), Ema::new(12), Ema::new(26));
        for c in &candles {
            rsi.update(c.close);
            macd.update(c.close);
            bb.update(c.close);
            e9.update(c.close);
            e21.update(c.close);
            e12.update(c.close);
            e26.update(c.close);
        }
        let volumes: Vec<f64> = candles.iter().filter_map(|c| c.volume).collect();
        let volume_z = if volumes.len() >= 20 { volume_zscore(&volumes[volumes.len() - 20..]) } else { 0.0 };
        let last = candles.last()?;

        Some(SignalSnapshot {
            price: last.close,
            rsi14: rsi.get()?,
            macd: macd.get()?,
            bands: bb.get()?,
            ema9: e9.get()?,
            ema21: e21.get()?,
            ema12: e12.get().unwrap_or(0.0),
            ema26: e26.get().unwrap_or(0.0),
            vwap: vwap(&candles),
            volume: volumes.last().copied().unwrap_or(0.0),
            volume_z,
        })
    }

    pub fn trend_snapshot(&self, min_history: usize, sma_short: usize, sma_long: usize) -> Option<TrendSnapshot> {
        if self.len() < min_history.max(1) {
            return None;
        }
        let candles = self.contiguous();
        let mut short = Sma::new(sma_short);
        let mut long = Sma::new(sma_long);
        let mut macd = Macd::default_12_26_9();
        let mut adx = Adx::new(14);
        let mut atr = Atr::new(14);
        let mut atr_values = Vec::with_capacity(candles.len());
        for c in &candles {
            short.update(c.close);
            long.update(c.close);
            macd.update(c.close);
            adx.update(c.high, c.low, c.close);
            if let Some(v) = atr.update(c.high, c.low, c.close) {
                atr_values.push(v);
            }
        }

        Some(TrendSnapshot {
            sma_short: short.get().or_else(|| short.partial())?,
            sma_long: long.get().or_else(|| long.partial())?,
            macd: macd.get()?,
            adx: adx.get(),
            atr: atr.get(),
            choppiness: choppiness(&atr_values, &candles, 14),
        })
    }
}
