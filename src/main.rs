#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mesh_schema_rust::run_worker().await
}
