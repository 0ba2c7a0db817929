use iperf_mesh::error::AppResult;

fn main() -> AppResult<()> {
    iperf_mesh::run()
}
