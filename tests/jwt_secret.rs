use std::process::Command;

#[test]
fn server_refuses_to_start_without_jwt_secret() {
    let exe = env!("CARGO_BIN_EXE_decision-backend");
    let output = Command::new(exe)
        .env_remove("JWT_SECRET")
        .env("DATABASE_URL", "postgres://invalid@127.0.0.1:1/none")
        .output()
        .expect("failed to run decision-backend binary");
    assert!(!output.status.success());
}
