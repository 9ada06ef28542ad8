//! Engine-initiated deletion.
//!
//! Local artifacts are removed sidecar first, then the cleanup is broadcast
//! to every other target; nobody waits for acknowledgements, the responders'
//! best-effort removal suffices.
use futures::Future;
use prometrics::metrics::Histogram;
use slog::Logger;
use std::time::Instant;

use crate::config::SmapRef;
use crate::layout::Store;
use crate::transport::TransportBundle;
use crate::util::{io_task, BoxFuture};

pub(crate) fn delete_object(
    logger: &Logger,
    store: &Store,
    smap: &SmapRef,
    transport: &TransportBundle,
    local_id: &str,
    bucket: &str,
    name: &str,
    delete_duration_seconds: &Histogram,
) -> BoxFuture<()> {
    let started_at = Instant::now();
    let logger = logger.clone();
    let store = store.clone();
    let smap = smap.get();
    let transport = transport.clone();
    let local_id = local_id.to_owned();
    let bucket = bucket.to_owned();
    let name = name.to_owned();
    let delete_duration_seconds = delete_duration_seconds.clone();

    let local = {
        let logger = logger.clone();
        let bucket = bucket.clone();
        let name = name.clone();
        io_task(move || {
            for (path, e) in store.remove_object(&bucket, &name) {
                warn!(logger, "Failed to remove {:?}: {}", path, e);
            }
            Ok(())
        })
    };
    Box::new(local.map(move |()| {
        for target in smap.targets.iter().filter(|t| t.id != local_id) {
            if !transport.delete(target, &bucket, &name) {
                warn!(
                    logger,
                    "Failed to queue a cleanup notification for {}/{} to {}",
                    bucket,
                    name,
                    target.id
                );
            }
        }
        delete_duration_seconds.observe(prometrics::timestamp::duration_to_seconds(
            started_at.elapsed(),
        ));
    }))
}
