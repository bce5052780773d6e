use chrono::{DateTime, Local};

pub fn get_version_info() -> &'static str {
    let version = env!("CARGO_PKG_VERSION");
    let build_time = env!("BUILD_TIME");
    let git_commit = env!("GIT_COMMIT_HASH");

    let build_timestamp: i64 = build_time.parse().unwrap_or(0);
    let build_datetime: DateTime<Local> = DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now);
    let build_time_str = build_datetime.format("%Y-%m-%d %H:%M:%S %Z").to_string();

    Box::leak(
        format!(
            "dialdesk {}\n\
         Build Time: {}\n\
         Git Commit: {}",
            version, build_time_str, git_commit
        )
        .into_boxed_str(),
    )
}

pub fn get_short_version() -> &'static str {
    let version = env!("CARGO_PKG_VERSION");
    let git_commit = env!("GIT_COMMIT_HASH");
    Box::leak(format!("dialdesk {}-{}", version, git_commit).into_boxed_str())
}
