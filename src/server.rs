use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use uuid::Uuid;

use serp_harvester_lib::{export, input_loader, logger, AppConfig, ExtractionMode};

mod job_manager;
use job_manager::{JobManager, JobState, RunForm};

// Uploaded query lists are small; anything bigger is a mistake.
const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

struct AppState {
    job_manager: Arc<JobManager>,
}

#[get("/api/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    let manager = &data.job_manager;
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "credential_configured": manager.blocking_error().is_none(),
        "error": manager.blocking_error(),
        "default_locale": manager.default_locale(),
        "modes": [ExtractionMode::Links, ExtractionMode::Snippet, ExtractionMode::Question],
    }))
}

#[post("/api/upload")]
async fn upload_file(mut payload: Multipart) -> impl Responder {
    let mut file_name = String::from("upload.txt");
    let mut bytes: Vec<u8> = Vec::new();
    let mut found = false;

    while let Ok(Some(mut field)) = payload.try_next().await {
        let content_disposition = field.content_disposition();
        if content_disposition.get_name().unwrap_or("") != "file" {
            continue;
        }
        if let Some(original_name) = content_disposition.get_filename() {
            file_name = original_name.to_string();
        }
        found = true;

        while let Some(chunk) = field.next().await {
            match chunk {
                Ok(data) => {
                    if bytes.len() + data.len() > MAX_UPLOAD_BYTES {
                        return HttpResponse::PayloadTooLarge().json(serde_json::json!({
                            "status": "error",
                            "message": "Query file is larger than 5 MB."
                        }));
                    }
                    bytes.extend_from_slice(&data);
                }
                Err(e) => {
                    return HttpResponse::BadRequest().json(serde_json::json!({
                        "status": "error",
                        "message": format!("Upload interrupted: {}", e)
                    }));
                }
            }
        }
    }

    if !found {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": "Expected a multipart field named \"file\"."
        }));
    }

    match input_loader::load_queries_from_bytes(&file_name, bytes, None) {
        Ok(queries) => HttpResponse::Ok().json(serde_json::json!({
            "status": "success",
            "count": queries.len(),
            "queries": queries,
        })),
        Err(e) => HttpResponse::UnprocessableEntity().json(serde_json::json!({
            "status": "error",
            "message": e.to_string()
        })),
    }
}

#[post("/api/run")]
async fn run_batch(form: web::Json<RunForm>, data: web::Data<AppState>) -> impl Responder {
    let job_id = Uuid::new_v4().to_string();

    match data.job_manager.start_job(job_id, form.into_inner()) {
        Ok(job_id) => HttpResponse::Ok().json(serde_json::json!({
            "status": "success",
            "job_id": job_id,
            "message": "Run queued."
        })),
        // Configuration problem: nothing can run until it is fixed.
        Err(message) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "error",
            "message": message
        })),
    }
}

#[get("/api/status/{job_id}")]
async fn get_status(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    match data.job_manager.status(&path.into_inner()) {
        Some(job) => HttpResponse::Ok().json(job),
        None => HttpResponse::NotFound().json("Job not found"),
    }
}

#[get("/api/results/{job_id}")]
async fn get_results(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    let Some(job) = data.job_manager.status(&path.into_inner()) else {
        return HttpResponse::NotFound().json("Job not found");
    };
    let Some(batch) = job.result else {
        return HttpResponse::NotFound().json("Results not ready yet.");
    };

    let rows: Vec<Vec<&str>> = batch.rows.iter().map(|r| r.values()).collect();
    HttpResponse::Ok().json(serde_json::json!({
        "mode": batch.mode,
        "columns": batch.mode.columns(),
        "rows": rows,
        "reports": batch.reports,
        "empty_queries": batch.empty_queries(),
        "message": job.message,
        "cached": job.cached,
    }))
}

#[get("/api/download/{job_id}/{format}")]
async fn download_result(path: web::Path<(String, String)>, data: web::Data<AppState>) -> impl Responder {
    let (job_id, format) = path.into_inner();
    let batch = match data.job_manager.status(&job_id) {
        Some(job) if job.status == JobState::Completed => job.result,
        Some(_) => None,
        None => return HttpResponse::NotFound().body("Job not found."),
    };
    let Some(batch) = batch else {
        return HttpResponse::NotFound().body("Result file not generated yet.");
    };

    let (bytes, mime, extension) = match format.as_str() {
        "csv" => (export::to_csv(batch.mode, &batch.rows), export::CSV_MIME, "csv"),
        "xlsx" => (export::to_spreadsheet(batch.mode, &batch.rows), export::XLSX_MIME, "xlsx"),
        _ => return HttpResponse::BadRequest().body("Format must be csv or xlsx."),
    };

    match bytes {
        Ok(bytes) => HttpResponse::Ok()
            .content_type(mime)
            .append_header((
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", export::file_name(batch.mode, extension)),
            ))
            .body(bytes),
        Err(e) => {
            log::error!("Export of job {} failed: {}", job_id, e);
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    logger::init();

    let config = AppConfig::from_env();
    let bind_addr = config.bind_addr.clone();
    let job_manager = Arc::new(JobManager::new(config));
    if let Some(e) = job_manager.blocking_error() {
        log::error!("Runs are disabled until this is fixed: {}", e);
    }
    let state = web::Data::new(AppState { job_manager });

    log::info!("Starting Web Server at http://{}", bind_addr);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .service(health_check)
            .service(upload_file)
            .service(run_batch)
            .service(get_status)
            .service(get_results)
            .service(download_result)
    })
    .bind(bind_addr)?
    .run()
    .await
}
