use chrono::Local;
use hourly_pricing::{fetch_tomorrows_pricing, observability, table};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    observability::init_tracing();

    let pricing = fetch_tomorrows_pricing(Local::now().date_naive()).await;

    if let Err(err) = table::print_pricing(&pricing) {
        tracing::error!(error = %err, "writing pricing table failed");
    }
}
