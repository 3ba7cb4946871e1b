//! TCP listeners for the two sides of the dispatch fabric: clients
//! pushing service requests and workers pulling work items, joined by
//! the per-queue FIFO.

use std::process;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use devscale_core::proto::{self, Reply, ServiceRequest, WorkItem, WorkRequest};
use devscale_core::queue::{DispatchQueue, Pull, QueueItem, QueueSet};
use devscale_core::wire;

/// Accept client connections and queue their service requests.
pub async fn listen_for_clients(queues: Arc<QueueSet>, addr: String) {
    info!(%addr, "queueing client service request work items");

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "client listen failed");
            process::exit(1);
        }
    };

    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                debug!(%peer, "client connected");
                queues.count_client();
                tokio::spawn(handle_client(Arc::clone(&queues), conn));
            }
            Err(e) => warn!(%addr, error = %e, "client accept failed"),
        }
    }
}

/// Accept worker connections and pair their pull requests with queued
/// items.
pub async fn listen_for_workers(queues: Arc<QueueSet>, addr: String) {
    info!(%addr, "providing queued work items for backends");

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "worker listen failed");
            process::exit(1);
        }
    };

    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                debug!(%peer, "worker connected");
                queues.count_worker();
                tokio::spawn(handle_worker(Arc::clone(&queues), conn));
            }
            Err(e) => warn!(%addr, error = %e, "worker accept failed"),
        }
    }
}

/// Reply to a client with an error record and close the connection.
async fn error_reply_close(conn: TcpStream, msg: String) {
    debug!(%msg, "rejecting with error reply");
    match proto::encode(&Reply::error(msg)) {
        Ok(data) => {
            wire::send_close(conn, &data).await;
        }
        Err(e) => {
            error!(error = %e, "internal reply encoding error");
            process::exit(1);
        }
    }
}

/// Reply to a worker with an error work item and close the connection.
async fn item_reply_close(conn: TcpStream, empty: bool, msg: String) {
    debug!(%msg, empty, "rejecting work request");
    let item = WorkItem {
        error: msg,
        empty,
        ..WorkItem::default()
    };
    match proto::encode(&item) {
        Ok(data) => {
            wire::send_close(conn, &data).await;
        }
        Err(e) => {
            error!(error = %e, "internal work item encoding error");
            process::exit(1);
        }
    }
}

/// Read and validate one service request, then either queue it with its
/// connection or reply with an error. The queue owns the connection from
/// admission on.
async fn handle_client(queues: Arc<QueueSet>, mut conn: TcpStream) {
    let data = match wire::read_message(&mut conn).await {
        Ok(data) => data,
        Err(e) => {
            return error_reply_close(conn, format!("service request read failed: {e}")).await;
        }
    };
    debug!(bytes = data.len(), "service request received");

    let req: ServiceRequest = match proto::decode(&data) {
        Ok(req) => req,
        Err(e) => return error_reply_close(conn, e.to_string()).await,
    };

    if req.queue.is_empty() {
        return error_reply_close(conn, "invalid queue name ''".to_string()).await;
    }
    let Some(queue) = queues.get(&req.queue) else {
        return error_reply_close(conn, format!("unknown '{}' queue", req.queue)).await;
    };

    if let Err(item) = queue.admit(QueueItem::new(conn, req.args, req.limit)) {
        let msg = format!(
            "'{}' queue already at full capacity ({})",
            req.queue,
            queues.qmax()
        );
        error_reply_close(item.client, msg).await;
    }
}

/// Read and validate one work request, then hand over the queue head (a
/// dispatch task ferries it) or report the queue as empty.
async fn handle_worker(queues: Arc<QueueSet>, mut conn: TcpStream) {
    let data = match wire::read_message(&mut conn).await {
        Ok(data) => data,
        Err(e) => {
            return item_reply_close(conn, false, format!("work request read failed: {e}")).await;
        }
    };
    debug!(bytes = data.len(), "work item request received");

    let req: WorkRequest = match proto::decode(&data) {
        Ok(req) => req,
        Err(e) => return item_reply_close(conn, false, e.to_string()).await,
    };

    if req.queue.is_empty() {
        return item_reply_close(conn, false, "invalid queue name ''".to_string()).await;
    }
    let Some(queue) = queues.get(&req.queue) else {
        return item_reply_close(conn, false, format!("unknown '{}' queue", req.queue)).await;
    };

    match queue.pull() {
        Pull::Empty { pruned } => {
            if pruned > 0 {
                warn!(
                    count = pruned,
                    queue = %req.queue,
                    "discarded requests from disappeared clients"
                );
            }
            item_reply_close(conn, true, format!("Queue '{}' is empty", req.queue)).await;
        }
        Pull::Item { item, pruned } => {
            if pruned > 0 {
                warn!(
                    count = pruned,
                    queue = %req.queue,
                    "discarded requests from disappeared clients"
                );
            }
            tokio::spawn(dispatch(queue, conn, item));
        }
    }
}

/// Ferry one item to its worker and the reply back to the client, then
/// settle the queue accounting. Runs concurrently with the listeners;
/// precondition: the queue's `running` count already covers this item.
async fn dispatch(queue: Arc<DispatchQueue>, worker: TcpStream, item: QueueItem) {
    let (reply, delivered) = run_dispatch(worker, item).await;
    queue.complete(&reply, delivered);
}

/// The wire round trip of one dispatch. Returns the reply used for
/// accounting and whether the client actually received it. Worker-side
/// failures turn into an error reply for the client; the default reply
/// carries `retcode` 1 so every early exit is accounted as a failure.
async fn run_dispatch(mut worker: TcpStream, item: QueueItem) -> (Reply, bool) {
    let QueueItem {
        client,
        added,
        args,
        limit,
    } = item;

    let work = WorkItem {
        args,
        limit,
        ..WorkItem::default()
    };
    let mut reply = Reply {
        retcode: 1,
        ..Reply::default()
    };

    let data = match proto::encode(&work) {
        Ok(data) => data,
        Err(e) => {
            reply.wait_time = added.elapsed().as_secs_f64();
            error_reply_close(client, format!("work item encoding failed: {e}")).await;
            return (reply, false);
        }
    };
    debug!(bytes = data.len(), "work item to worker");

    // the wait ends when the item leaves for the worker
    let wait_time = added.elapsed().as_secs_f64();
    reply.wait_time = wait_time;

    if let Err(e) = wire::write_message(&mut worker, &data).await {
        error_reply_close(client, format!("worker write failed: {e}")).await;
        return (reply, false);
    }

    let data = match wire::read_message(&mut worker).await {
        Ok(data) => data,
        Err(e) => {
            error_reply_close(client, format!("worker reply read failed: {e}")).await;
            return (reply, false);
        }
    };
    drop(worker);
    debug!(bytes = data.len(), "worker reply received");

    match proto::decode::<Reply>(&data) {
        Ok(mut decoded) => {
            decoded.wait_time = wait_time;
            reply = decoded;
        }
        Err(e) => {
            error_reply_close(client, e.to_string()).await;
            return (reply, false);
        }
    }

    let data = match proto::encode(&reply) {
        Ok(data) => data,
        Err(e) => {
            error_reply_close(client, format!("reply encoding failed: {e}")).await;
            return (reply, false);
        }
    };
    let delivered = wire::send_close(client, &data).await;
    (reply, delivered)
}
