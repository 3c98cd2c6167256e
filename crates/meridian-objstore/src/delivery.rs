//! Streamed pulls from peer stores.

use bytes::BytesMut;
use meridian_net::ObjStoreClient;
use meridian_proto::ObjRef;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::store::{LocalStore, Payload};

/// Pulls `objref` from the store at `src_addr` and finalizes it locally.
///
/// The first chunk is authoritative for the payload's total size and
/// metadata offset; the buffer is pre-allocated from it and each chunk is
/// written at the running offset. Consistency of the repeated metadata and
/// the declared size are validated as the stream is drained.
pub async fn pull_object(src_addr: &str, objref: ObjRef, store: &LocalStore) -> Result<Payload> {
    let client = ObjStoreClient::new(src_addr);
    let mut stream = client.stream_obj_to(objref).await.map_err(|e| {
        warn!(%objref, src = src_addr, error = %e, "failed to open transfer");
        StoreError::TransferFailed {
            objref,
            src: src_addr.to_owned(),
            reason: e.to_string(),
        }
    })?;

    let total_size = stream.total_size();
    let metadata_offset = stream.metadata_offset();
    let mut buf = BytesMut::with_capacity(total_size as usize);

    loop {
        match stream.next_chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk.data),
            Ok(None) => break,
            Err(e) => {
                return Err(StoreError::TransferFailed {
                    objref,
                    src: src_addr.to_owned(),
                    reason: e.to_string(),
                })
            }
        }
    }

    if buf.len() as u64 != total_size {
        return Err(StoreError::Truncated {
            objref,
            received: buf.len() as u64,
            expected: total_size,
        });
    }

    let payload = Payload {
        metadata_offset,
        data: buf.freeze(),
    };
    store.insert_finalized(objref, payload.clone());
    debug!(%objref, src = src_addr, total_size, "transfer complete");
    Ok(payload)
}
