//! Integration tests for coordinator and worker behavior
//!
//! These tests use SQLite databases in temporary directories and real CSV
//! files to test end to end scenarios of the loader with in-process workers.

#[cfg(test)]
mod tests {
    use crate::{
        coordination::{
            Coordinator, ImportConfig, ImportConfigBuilder, ImportStatus,
            coordinator::ImportReport,
            manifest::{LocalManifestStorage, PartitionStatus},
        },
        dataset::Dataset,
        formats::DelimitedConfig,
        runner::{ImportArgs, run_import},
    };
    use chrono::{Days, NaiveDate};
    use sqlx::SqlitePool;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::path::{Path, PathBuf};
    use std::str::FromStr;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::fs::File;
    use tokio::io::AsyncWriteExt;

    const HEADER: &str = "STATION,DATE,AWND,PGTM,PRCP,SNOW,SNWD,TAVG,TMAX,TMIN,TSUN,\
        WT01,WT02,WT03,WT04,WT05,WT06,WT08,WT09,WT11,WT13,WT14,WT16,WT18\n";

    const WEATHER_SCHEMA: &[&str] = &[
        "CREATE TABLE Weather (station TEXT NOT NULL, date TEXT NOT NULL)",
        "CREATE TABLE Wind (date TEXT NOT NULL, awnd REAL)",
        "CREATE TABLE Precipitation (date TEXT NOT NULL, prcp REAL, snow REAL, snwd REAL)",
        "CREATE TABLE Temperature (date TEXT NOT NULL, tmax INTEGER, tmin INTEGER)",
        "CREATE TABLE Wtypes (date TEXT NOT NULL, wt01 INTEGER, wt02 INTEGER, wt03 INTEGER, \
            wt04 INTEGER, wt05 INTEGER, wt06 INTEGER, wt08 INTEGER, wt09 INTEGER, \
            wt11 INTEGER, wt13 INTEGER, wt14 INTEGER, wt16 INTEGER, wt18 INTEGER)",
    ];

    // ============ Test Helpers ============

    fn date(row: usize) -> String {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(row as u64))
            .unwrap()
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Every row has the same width, so 100 rows split into 4 partitions of 25
    fn weather_row(row: usize) -> String {
        format!(
            "USW00094728,{},4.5,,0.12,0,0,,45,30,,1,,,,,,,,,,,,\n",
            date(row)
        )
    }

    /// A two-field record padded to the width of a regular row
    fn short_row() -> String {
        let width = weather_row(0).len();
        format!("{:<w$}\n", "short,row", w = width - 1)
    }

    /// A regular-width row whose date cannot be parsed
    fn bad_date_row() -> String {
        weather_row(0).replace(&date(0), "2020-13-45")
    }

    async fn create_weather_csv(dir: &TempDir, filename: &str, rows: &[String]) -> PathBuf {
        let path = dir.path().join(filename);
        let mut file = File::create(&path).await.unwrap();
        file.write_all(HEADER.as_bytes()).await.unwrap();
        for row in rows {
            file.write_all(row.as_bytes()).await.unwrap();
        }
        file.flush().await.unwrap();
        path
    }

    /// Create a file-backed SQLite database with the weather tables
    async fn setup_weather_db(dir: &TempDir) -> (String, SqlitePool) {
        let url = format!("sqlite://{}", dir.path().join("weather.db").display());
        let options = SqliteConnectOptions::from_str(&url)
            .unwrap()
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        for sql in WEATHER_SCHEMA {
            sqlx::query(sql).execute(&pool).await.unwrap();
        }
        (url, pool)
    }

    fn weather_config(source: &Path, url: &str, worker_count: usize) -> ImportConfig {
        ImportConfigBuilder::default()
            .dataset(Dataset::Weather)
            .source_path(source)
            .database_url(url)
            .worker_count(worker_count)
            .quiet(true)
            .build()
            .unwrap()
    }

    async fn run(manifest_dir: &TempDir, config: &ImportConfig) -> ImportReport {
        let coordinator = Coordinator::new(LocalManifestStorage::new(manifest_dir.path()));
        coordinator
            .run_import_until(config, std::future::pending())
            .await
            .unwrap()
    }

    async fn get_table_count(pool: &SqlitePool, table_name: &str) -> i64 {
        let sql = format!("SELECT COUNT(*) FROM {}", table_name);
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(pool).await.unwrap();
        count
    }

    /// Rows of `table` whose date belongs to source rows `first..last`
    async fn count_dates(pool: &SqlitePool, table: &str, first: usize, last: usize) -> i64 {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE date >= ? AND date < ?",
            table
        );
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(date(first))
            .bind(date(last))
            .fetch_one(pool)
            .await
            .unwrap();
        count
    }

    // ============ Tests ============

    #[tokio::test]
    async fn test_four_workers_load_every_row() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<String> = (0..100).map(weather_row).collect();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let report = run(&manifest_dir, &weather_config(&csv_path, &url, 4)).await;

        assert_eq!(report.status, ImportStatus::Succeeded);
        assert_eq!(report.total_records, 100);
        assert_eq!(report.partitions_planned, 4);
        assert_eq!(report.records_loaded, 100);
        assert_eq!(report.records_skipped, 0);

        let mut committed = report.committed_partitions.clone();
        committed.sort();
        assert_eq!(committed, vec![0, 1, 2, 3]);
        for result in &report.partition_results {
            assert_eq!(result.records_loaded, 25);
            assert_eq!(result.statements_executed, 125);
        }

        for table in ["Weather", "Wind", "Precipitation", "Temperature", "Wtypes"] {
            assert_eq!(get_table_count(&pool, table).await, 100, "{}", table);
        }

        let (prcp, tmax, wt01, wt02): (Option<f64>, Option<i64>, bool, bool) = sqlx::query_as(
            "SELECT p.prcp, t.tmax, w.wt01, w.wt02 FROM Precipitation p \
             JOIN Temperature t ON t.date = p.date \
             JOIN Wtypes w ON w.date = p.date WHERE p.date = ?",
        )
        .bind(date(42))
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(prcp, Some(0.12));
        assert_eq!(tmax, Some(45));
        assert!(wt01);
        assert!(!wt02);
    }

    #[tokio::test]
    async fn test_shape_error_is_skipped_and_reported() {
        let temp_dir = TempDir::new().unwrap();
        let mut rows: Vec<String> = (0..100).map(weather_row).collect();
        rows[30] = short_row();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let report = run(&manifest_dir, &weather_config(&csv_path, &url, 4)).await;

        assert_eq!(report.status, ImportStatus::Succeeded);
        assert_eq!(report.records_loaded, 99);
        assert_eq!(report.records_skipped, 1);
        assert_eq!(get_table_count(&pool, "Weather").await, 99);
        assert_eq!(count_dates(&pool, "Weather", 30, 31).await, 0);

        let skipping: Vec<_> = report
            .partition_results
            .iter()
            .filter(|r| r.records_skipped > 0)
            .collect();
        assert_eq!(skipping.len(), 1);
        assert_eq!(skipping[0].partition_id, 1);

        let skip = &skipping[0].skipped[0];
        assert_eq!(skip.line_number, 32);
        assert_eq!(
            skip.offset,
            (HEADER.len() + 30 * weather_row(0).len()) as u64
        );
        assert_eq!(skip.expected, 24);
        assert_eq!(skip.found, 2);
        assert_eq!(skip.fields, vec!["short".to_string(), "row".to_string()]);
    }

    #[tokio::test]
    async fn test_worker_fault_fails_import_without_its_rows() {
        let temp_dir = TempDir::new().unwrap();
        let mut rows: Vec<String> = (0..100).map(weather_row).collect();
        rows[30] = bad_date_row();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let report = run(&manifest_dir, &weather_config(&csv_path, &url, 4)).await;

        match &report.status {
            ImportStatus::Failed {
                partition_id,
                diagnostic,
            } => {
                assert_eq!(*partition_id, 1);
                assert!(diagnostic.contains("line 32"), "{}", diagnostic);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!report.committed_partitions.contains(&1));

        let failed = report
            .partition_results
            .iter()
            .find(|r| r.partition_id == 1)
            .unwrap();
        assert_eq!(failed.status, PartitionStatus::Failed);
        assert_eq!(failed.records_loaded, 0);
        let failure = failed.failure.as_ref().unwrap();
        assert_eq!(failure.fields.as_ref().unwrap()[1], "2020-13-45");

        // Nothing from the failed partition, everything from the committed ones
        assert_eq!(count_dates(&pool, "Weather", 25, 50).await, 0);
        assert_eq!(count_dates(&pool, "Wind", 25, 50).await, 0);
        for &partition_id in &report.committed_partitions {
            let first = partition_id as usize * 25;
            assert_eq!(count_dates(&pool, "Weather", first, first + 25).await, 25);
        }
        assert_eq!(
            get_table_count(&pool, "Weather").await,
            25 * report.committed_partitions.len() as i64
        );
    }

    #[tokio::test]
    async fn test_interrupt_stops_workers() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<String> = (0..100).map(weather_row).collect();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let coordinator = Coordinator::new(LocalManifestStorage::new(manifest_dir.path()));
        let report = coordinator
            .run_import_until(&weather_config(&csv_path, &url, 4), std::future::ready(()))
            .await
            .unwrap();

        assert_eq!(report.status, ImportStatus::Interrupted);
        assert!(report.committed_partitions.is_empty());
        assert_eq!(get_table_count(&pool, "Weather").await, 0);
    }

    fn rendering_config(source: &Path, url: &str, worker_count: usize) -> ImportConfig {
        ImportConfigBuilder::default()
            .dataset(Dataset::Weather)
            .source_path(source)
            .database_url(url)
            .worker_count(worker_count)
            .quiet(false)
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_while_workers_render_returns() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<String> = (0..2000).map(weather_row).collect();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let coordinator = Coordinator::new(LocalManifestStorage::new(manifest_dir.path()));
        let report = tokio::time::timeout(
            Duration::from_secs(60),
            coordinator.run_import_until(
                &rendering_config(&csv_path, &url, 4),
                tokio::time::sleep(Duration::from_millis(20)),
            ),
        )
        .await
        .expect("import did not return after the interrupt")
        .unwrap();

        // Workers may all finish before the interrupt fires
        assert!(
            matches!(
                report.status,
                ImportStatus::Interrupted | ImportStatus::Succeeded
            ),
            "{:?}",
            report.status
        );
        for &partition_id in &report.committed_partitions {
            let first = partition_id as usize * 500;
            assert_eq!(count_dates(&pool, "Weather", first, first + 500).await, 500);
        }
        assert_eq!(
            get_table_count(&pool, "Weather").await,
            500 * report.committed_partitions.len() as i64
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_fault_while_workers_render_returns() {
        let temp_dir = TempDir::new().unwrap();
        let mut rows: Vec<String> = (0..2000).map(weather_row).collect();
        rows[510] = bad_date_row();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let report = tokio::time::timeout(
            Duration::from_secs(60),
            run(&manifest_dir, &rendering_config(&csv_path, &url, 4)),
        )
        .await
        .expect("import did not return after the worker fault");

        match &report.status {
            ImportStatus::Failed { partition_id, .. } => assert_eq!(*partition_id, 1),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(count_dates(&pool, "Weather", 500, 1000).await, 0);
    }

    #[tokio::test]
    async fn test_header_only_file_succeeds_without_workers() {
        let temp_dir = TempDir::new().unwrap();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &[]).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let report = run(&manifest_dir, &weather_config(&csv_path, &url, 4)).await;

        assert_eq!(report.status, ImportStatus::Succeeded);
        assert_eq!(report.partitions_planned, 0);
        assert_eq!(report.records_loaded, 0);
        assert_eq!(get_table_count(&pool, "Weather").await, 0);
    }

    #[tokio::test]
    async fn test_more_workers_than_records() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<String> = (0..3).map(weather_row).collect();
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let report = run(&manifest_dir, &weather_config(&csv_path, &url, 16)).await;

        assert_eq!(report.status, ImportStatus::Succeeded);
        assert_eq!(report.partitions_planned, 3);
        assert_eq!(get_table_count(&pool, "Temperature").await, 3);
    }

    #[tokio::test]
    async fn test_crlf_and_missing_final_newline() {
        let temp_dir = TempDir::new().unwrap();
        let mut rows: Vec<String> = (0..10)
            .map(|i| weather_row(i).replace('\n', "\r\n"))
            .collect();
        if let Some(last) = rows.last_mut() {
            last.truncate(last.len() - 2);
        }
        let csv_path = create_weather_csv(&temp_dir, "weather.csv", &rows).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let manifest_dir = TempDir::new().unwrap();
        let report = run(&manifest_dir, &weather_config(&csv_path, &url, 3)).await;

        assert_eq!(report.status, ImportStatus::Succeeded);
        assert_eq!(report.total_records, 10);
        assert_eq!(report.records_loaded, 10);
        assert_eq!(count_dates(&pool, "Wtypes", 0, 10).await, 10);
    }

    #[tokio::test]
    async fn test_runner_imports_files_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let first: Vec<String> = (0..40).map(weather_row).collect();
        let second: Vec<String> = (40..60).map(weather_row).collect();
        let first_path = create_weather_csv(&temp_dir, "weather-1.csv", &first).await;
        let second_path = create_weather_csv(&temp_dir, "weather-2.csv", &second).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let summary = run_import(ImportArgs {
            dataset: Dataset::Weather,
            source_files: vec![first_path, second_path],
            database_url: url,
            worker_count: Some(2),
            in_process: true,
            manifest_dir: None,
            keep_manifest: false,
            dialect: DelimitedConfig::csv(),
            quiet: true,
        })
        .await
        .unwrap();

        assert_eq!(summary.status(), ImportStatus::Succeeded);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.records_loaded, 60);
        assert!(summary.persisted_manifest_dir.is_none());
        assert_eq!(get_table_count(&pool, "Weather").await, 60);
    }

    #[tokio::test]
    async fn test_runner_stops_at_first_failed_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut first: Vec<String> = (0..20).map(weather_row).collect();
        first[5] = bad_date_row();
        let second: Vec<String> = (20..40).map(weather_row).collect();
        let first_path = create_weather_csv(&temp_dir, "weather-1.csv", &first).await;
        let second_path = create_weather_csv(&temp_dir, "weather-2.csv", &second).await;
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let summary = run_import(ImportArgs {
            dataset: Dataset::Weather,
            source_files: vec![first_path, second_path],
            database_url: url,
            worker_count: Some(1),
            in_process: true,
            manifest_dir: None,
            keep_manifest: false,
            dialect: DelimitedConfig::csv(),
            quiet: true,
        })
        .await
        .unwrap();

        assert!(matches!(
            summary.status(),
            ImportStatus::Failed { partition_id: 0, .. }
        ));
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.files.len(), 1);
        assert_eq!(get_table_count(&pool, "Weather").await, 0);

        let persisted = summary.persisted_manifest_dir.unwrap();
        let job_id = &summary.files[0].report.job_id;
        assert!(
            persisted
                .join("jobs")
                .join(job_id)
                .join("partitions/0000.result")
                .exists()
        );
        std::fs::remove_dir_all(persisted).unwrap();
    }

    #[tokio::test]
    async fn test_tab_delimited_with_quoted_fields() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("weather.tsv");
        let header = HEADER.replace(',', "\t");
        let row = weather_row(0)
            .replace(',', "\t")
            .replace("USW00094728", "\"USW 94728\"");
        tokio::fs::write(&path, format!("{}{}", header, row))
            .await
            .unwrap();
        let (url, pool) = setup_weather_db(&temp_dir).await;

        let config = ImportConfigBuilder::default()
            .dataset(Dataset::Weather)
            .source_path(&path)
            .database_url(&url)
            .worker_count(1)
            .dialect(DelimitedConfig::tsv())
            .quiet(true)
            .build()
            .unwrap();
        let manifest_dir = TempDir::new().unwrap();
        let report = run(&manifest_dir, &config).await;

        assert_eq!(report.status, ImportStatus::Succeeded);
        let (station,): (String,) = sqlx::query_as("SELECT station FROM Weather")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(station, "USW 94728");
    }
}
