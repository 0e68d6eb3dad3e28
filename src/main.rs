#[tokio::main]
async fn main() {
    if let Err(e) = care_coordinator_lib::run().await {
        eprintln!("care-coordinator: {e}");
        std::process::exit(1);
    }
}
