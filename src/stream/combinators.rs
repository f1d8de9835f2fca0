//! Lazy combinators over event streams: `filter`, `transform`, `aggregate`,
//! `merge`. All take and return boxed [`StreamEvent`] streams so they chain
//! freely with [`super::ModeSubscriber::into_stream`].

use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;

use super::StreamEvent;

/// Pass through only events matching `predicate`.
pub fn filter(
    stream: BoxStream<'static, StreamEvent>,
    predicate: impl Fn(&StreamEvent) -> bool + Send + 'static,
) -> BoxStream<'static, StreamEvent> {
    Box::pin(stream.filter(move |event| futures::future::ready(predicate(event))))
}

/// Map every event through `f`.
pub fn transform(
    stream: BoxStream<'static, StreamEvent>,
    f: impl FnMut(StreamEvent) -> StreamEvent + Send + 'static,
) -> BoxStream<'static, StreamEvent> {
    Box::pin(stream.map(f))
}

/// When an aggregation buffer flushes.
#[derive(Debug, Clone, Copy)]
pub enum FlushPolicy {
    /// Every `n` buffered events.
    Count(usize),
    /// On a timer tick, whenever the buffer is non-empty.
    Interval(Duration),
    /// Once, when the input stream ends.
    OnEnd,
}

/// Accumulate events and emit `reducer(buffer)` according to `policy`. A
/// non-empty remainder always flushes when the input ends.
pub fn aggregate(
    stream: BoxStream<'static, StreamEvent>,
    reducer: impl Fn(Vec<StreamEvent>) -> StreamEvent + Send + 'static,
    policy: FlushPolicy,
) -> BoxStream<'static, StreamEvent> {
    match policy {
        FlushPolicy::Count(n) => {
            let n = n.max(1);
            Box::pin(async_stream::stream! {
                let mut stream = stream;
                let mut buffer = Vec::new();
                while let Some(event) = stream.next().await {
                    buffer.push(event);
                    if buffer.len() >= n {
                        yield reducer(std::mem::take(&mut buffer));
                    }
                }
                if !buffer.is_empty() {
                    yield reducer(buffer);
                }
            })
        }
        FlushPolicy::Interval(period) => Box::pin(async_stream::stream! {
            let mut stream = stream;
            let mut buffer = Vec::new();
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Some(event) => buffer.push(event),
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            yield reducer(std::mem::take(&mut buffer));
                        }
                    }
                }
            }
            if !buffer.is_empty() {
                yield reducer(buffer);
            }
        }),
        FlushPolicy::OnEnd => Box::pin(async_stream::stream! {
            let buffer: Vec<StreamEvent> = stream.collect().await;
            if !buffer.is_empty() {
                yield reducer(buffer);
            }
        }),
    }
}

/// Interleave several streams. Relative order within each input stream is
/// preserved; order across streams follows readiness.
pub fn merge(
    streams: Vec<BoxStream<'static, StreamEvent>>,
) -> BoxStream<'static, StreamEvent> {
    Box::pin(futures::stream::select_all(streams))
}
