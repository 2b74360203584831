#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sql_matic_lib::run().await
}
