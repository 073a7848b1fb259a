use std::future::Future;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web::dev::ServerHandle;
use actix_web::http::{KeepAlive, StatusCode};
use actix_web::web::ServiceConfig;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, trace};
use crate::common::{bencode_failure, parse_query, QueryMap};
use crate::handlers::{handle_announce, handle_report, handle_scrape, handle_update, RequestMeta};
use crate::tracker::{InfoHash, TorrentTracker, TrackerStatus};

#[derive(Default, Clone)]
pub struct ClientOpts {
    pub gzip: bool,
    pub html: bool,
    pub json: bool,
    pub http_close: bool,
}

pub fn http_service_routes(data: Arc<TorrentTracker>) -> Box<dyn Fn(&mut ServiceConfig)> {
    Box::new(move |cfg: &mut ServiceConfig| {
        cfg.app_data(web::Data::new(data.clone()));
        cfg.service(web::resource("/robots.txt").route(web::get().to(http_service_robots)));
        cfg.service(web::resource("/{passkey}/{action}").route(web::get().to(http_service_entry)));
        cfg.default_service(web::route().to(http_service_not_found));
    })
}

pub async fn http_service(addr: SocketAddr, data: Arc<TorrentTracker>) -> (ServerHandle, impl Future<Output = Result<(), std::io::Error>>) {
    let config = data.config.clone();
    let data_cloned = data;
    let keep_alive = if config.tracker.keepalive_timeout == 0 {
        KeepAlive::Disabled
    } else {
        KeepAlive::Timeout(Duration::from_secs(config.tracker.keepalive_timeout))
    };
    let server_builder = HttpServer::new(move || {
        App::new().configure(http_service_routes(data_cloned.clone()))
    })
        .keep_alive(keep_alive)
        .client_request_timeout(Duration::from_secs(config.tracker.connection_timeout))
        .max_connections(config.tracker.max_connections)
        .disable_signals();

    let listen_path = config.tracker.listen_path.clone();
    if listen_path.is_empty() {
        info!("[SERVICE] Starting server listener on {}", addr);
        let server = server_builder
            .bind((addr.ip(), addr.port()))
            .unwrap_or_else(|error| {
                log::error!("Unable to bind {} ({})", addr, error);
                std::process::exit(1);
            })
            .run();
        let handle = server.handle();
        (handle, server)
    } else {
        let path = listen_path.strip_prefix("unix:").unwrap_or(listen_path.as_str()).to_string();
        info!("[SERVICE] Starting server listener on unix:{}", path);
        let server = server_builder
            .bind_uds(path.as_str())
            .unwrap_or_else(|error| {
                log::error!("Unable to bind unix socket {} ({})", path, error);
                std::process::exit(1);
            })
            .run();
        let handle = server.handle();
        (handle, server)
    }
}

/// Assembles the HTTP envelope around a tracker body: HTML wrap for
/// browsers, gzip when negotiated, the Server banner, and the Connection
/// header when keep-alive is off.
pub fn build_response(data: &Arc<TorrentTracker>, body: Vec<u8>, opts: &ClientOpts, status: u16) -> HttpResponse {
    let mut opts = opts.clone();
    let mut body = body;
    if opts.html {
        let mut wrapped = Vec::with_capacity(body.len() + 96);
        wrapped.extend_from_slice(b"<html><head><meta name=\"robots\" content=\"noindex, nofollow\" /></head><body>");
        wrapped.extend_from_slice(body.as_slice());
        wrapped.extend_from_slice(b"</body></html>");
        body = wrapped;
    }
    if opts.gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        match encoder.write_all(body.as_slice()).and_then(|_| encoder.finish()) {
            Ok(compressed) => body = compressed,
            Err(_) => opts.gzip = false,
        }
    }

    data.stats.bytes_written.fetch_add(body.len() as i64, Ordering::Relaxed);

    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut builder = HttpResponse::build(status_code);
    builder.insert_header(("Server", format!("Radiance {}", env!("CARGO_PKG_VERSION"))));
    let content_type = if opts.html {
        "text/html"
    } else if opts.json {
        "application/json"
    } else {
        "text/plain"
    };
    builder.insert_header(("Content-Type", content_type));
    if opts.gzip {
        builder.insert_header(("Content-Encoding", "gzip"));
    }
    if opts.http_close {
        builder.force_close();
    }
    builder.body(body)
}

fn failure(data: &Arc<TorrentTracker>, reason: &str, opts: &ClientOpts) -> HttpResponse {
    build_response(data, bencode_failure(reason), opts, 200)
}

fn header_value(request: &HttpRequest, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

fn request_stats(request: &HttpRequest, data: &Arc<TorrentTracker>) {
    data.stats.requests.fetch_add(1, Ordering::Relaxed);
    data.stats.opened_connections.fetch_add(1, Ordering::Relaxed);
    let mut read = request.uri().to_string().len() + 16;
    for (name, value) in request.headers().iter() {
        read += name.as_str().len() + value.len() + 4;
    }
    data.stats.bytes_read.fetch_add(read as i64, Ordering::Relaxed);
}

async fn http_service_robots(request: HttpRequest, data: web::Data<Arc<TorrentTracker>>) -> HttpResponse {
    request_stats(&request, data.as_ref());
    let opts = ClientOpts {
        http_close: data.config.tracker.keepalive_timeout == 0,
        ..ClientOpts::default()
    };
    build_response(data.as_ref(), b"User-agent: *\nDisallow: /".to_vec(), &opts, 200)
}

async fn http_service_not_found(request: HttpRequest, data: web::Data<Arc<TorrentTracker>>) -> HttpResponse {
    request_stats(&request, data.as_ref());
    let opts = ClientOpts {
        http_close: data.config.tracker.keepalive_timeout == 0,
        ..ClientOpts::default()
    };
    failure(data.as_ref(), "Malformed announce", &opts)
}

pub async fn http_service_entry(request: HttpRequest, path: web::Path<(String, String)>, data: web::Data<Arc<TorrentTracker>>) -> HttpResponse {
    request_stats(&request, data.as_ref());
    let data = data.as_ref();
    let (passkey, action) = path.into_inner();
    let opts = ClientOpts {
        http_close: data.config.tracker.keepalive_timeout == 0,
        ..ClientOpts::default()
    };

    if request.query_string().len() > data.config.tracker.max_request_size {
        return failure(data, "GET string too long", &opts);
    }

    if passkey.len() != 32 {
        return failure(data, "Malformed announce", &opts);
    }

    // Not a torrent client speaking the announce protocol.
    if request.query_string().is_empty() {
        let html_opts = ClientOpts { html: true, ..opts.clone() };
        return build_response(data, b"Tracker is running".to_vec(), &html_opts, 200);
    }

    let verb = action.chars().next();
    match verb {
        Some('a') => {
            data.stats.announcements.fetch_add(1, Ordering::Relaxed);
        }
        Some('s') => {
            data.stats.scrapes.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }

    if data.status() != TrackerStatus::Open {
        return failure(data, "The tracker is temporarily unavailable.", &opts);
    }

    let params = match parse_query(Some(request.query_string().to_string())) {
        Ok(params) => params,
        Err(error) => return failure(data, error.message.as_str(), &opts),
    };

    match verb {
        Some('a') => http_service_announce(&request, data, passkey.as_str(), &params, &opts),
        Some('s') => http_service_scrape(&request, data, passkey.as_str(), &params, &opts),
        Some('u') => {
            if passkey == data.config.tracker.site_password {
                let response_code = handle_update(data, &params);
                build_response(data, b"success".to_vec(), &opts, response_code)
            } else {
                failure(data, "Authentication failure", &opts)
            }
        }
        Some('r') => {
            if passkey == data.config.tracker.report_password {
                let body = handle_report(data, &params);
                let json_opts = ClientOpts { json: true, ..opts.clone() };
                build_response(data, body.into_bytes(), &json_opts, 200)
            } else {
                failure(data, "Authentication failure", &opts)
            }
        }
        _ => failure(data, "Invalid action", &opts),
    }
}

fn http_service_announce(request: &HttpRequest, data: &Arc<TorrentTracker>, passkey: &str, params: &QueryMap, opts: &ClientOpts) -> HttpResponse {
    let user = match data.find_user(passkey) {
        Some(user) => user,
        None => {
            trace!("Passkey not found {}", passkey);
            return failure(data, "Passkey not found", opts);
        }
    };

    let remote_ip: IpAddr = match request.peer_addr() {
        Some(addr) => addr.ip(),
        None => return failure(data, "Invalid IP detected", opts),
    };

    let host = header_value(request, "x-forwarded-host")
        .or_else(|| header_value(request, "host"))
        .unwrap_or_else(|| String::from("unknown"));
    let domain = data.find_or_create_domain(host.as_str());

    let meta = RequestMeta {
        remote_ip,
        forwarded_for: header_value(request, "x-forwarded-for"),
        user_agent: header_value(request, "user-agent").unwrap_or_default(),
    };

    let info_hash = match crate::handlers::param_first(params, "info_hash").and_then(InfoHash::from_slice) {
        Some(info_hash) => info_hash,
        None => return failure(data, "Unregistered torrent", opts),
    };

    let mut torrents = data.torrents.lock();
    let torrent = match torrents.get_mut(&info_hash) {
        Some(torrent) => torrent,
        None => {
            drop(torrents);
            // Removed torrents keep a short-lived reason so clients learn
            // why their announce no longer works.
            return match data.del_reason_for(&info_hash) {
                Some(message) if message.reason != -1 => {
                    failure(data, format!("Unregistered torrent: {}", crate::tracker::get_del_reason(message.reason)).as_str(), opts)
                }
                _ => failure(data, "Unregistered torrent", opts),
            };
        }
    };

    let result = handle_announce(data, torrent, &user, &domain, params, &meta);
    drop(torrents);
    match result {
        Ok(body) => build_response(data, body, opts, 200),
        Err(error) => failure(data, error.message.as_str(), opts),
    }
}

fn http_service_scrape(request: &HttpRequest, data: &Arc<TorrentTracker>, passkey: &str, params: &QueryMap, opts: &ClientOpts) -> HttpResponse {
    if data.find_user(passkey).is_none() {
        trace!("Passkey not found {}", passkey);
        return failure(data, "Passkey not found", opts);
    }
    let info_hashes: Vec<Vec<u8>> = params.get("info_hash").cloned().unwrap_or_default();
    let body = handle_scrape(data, info_hashes.as_slice());
    let accept_gzip = header_value(request, "accept-encoding").map(|value| value.contains("gzip")).unwrap_or(false);
    let scrape_opts = ClientOpts { gzip: accept_gzip, ..opts.clone() };
    build_response(data, body, &scrape_opts, 200)
}
