//! Streaming batcher for storage writes.

use futures::stream::{self, BoxStream, Stream, StreamExt};

/// Optional `[start, stop)` slice applied before batching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkWindow {
    pub start: usize,
    pub stop: Option<usize>,
}

impl ChunkWindow {
    pub fn new(start: usize, stop: Option<usize>) -> Self {
        Self { start, stop }
    }
}

struct ChunkState<T, E> {
    items: BoxStream<'static, Result<T, E>>,
    index: usize,
    done: bool,
}

/// Groups `items` into batches of `size` (`0` means one batch with everything
/// left after slicing). Each batch pulls exactly the items it returns; the
/// last one may be shorter and an exhausted input yields no further batches.
/// The first upstream error is passed through and ends the stream.
pub fn chunk<S, T, E>(
    items: S,
    size: usize,
    window: ChunkWindow,
) -> BoxStream<'static, Result<Vec<T>, E>>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let state = ChunkState {
        items: items.boxed(),
        index: 0,
        done: false,
    };

    stream::unfold(state, move |mut st| async move {
        if st.done {
            return None;
        }

        let mut batch = Vec::new();
        loop {
            if size != 0 && batch.len() == size {
                break;
            }
            if window.stop.is_some_and(|stop| st.index >= stop) {
                st.done = true;
                break;
            }
            match st.items.next().await {
                Some(Ok(item)) => {
                    let position = st.index;
                    st.index += 1;
                    if position >= window.start {
                        batch.push(item);
                    }
                }
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
                None => {
                    st.done = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some((Ok(batch), st))
        }
    })
    .boxed()
}
