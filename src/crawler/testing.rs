//! Scripted `Fetch` implementation for pipeline tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::error::CrawlError;
use super::fetch::{Fetch, FetchedPage};

#[derive(Clone)]
enum Reply {
    Page(u16, String),
    NetworkFailure,
}

struct Route {
    pattern: String,
    /// Consumed front to back; the last reply sticks once the queue is down to one.
    replies: VecDeque<Reply>,
}

/// Routes match when the pattern is a substring of the requested URL; the
/// first matching route wins. Unrouted URLs answer 404. POSTs are logged as
/// `POST <url>` and routed like GETs.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, pattern: &str, reply: Reply) -> Self {
        {
            let mut routes = self.routes.lock().unwrap();
            match routes.iter_mut().find(|r| r.pattern == pattern) {
                Some(route) => route.replies.push_back(reply),
                None => routes.push(Route {
                    pattern: pattern.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn page(self, pattern: &str, status: u16, body: &str) -> Self {
        self.push(pattern, Reply::Page(status, body.to_string()))
    }

    /// Queue `times` network failures for the pattern, ahead of later replies.
    pub fn fail(mut self, pattern: &str, times: usize) -> Self {
        for _ in 0..times {
            self = self.push(pattern, Reply::NetworkFailure);
        }
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn request_count(&self, pattern: &str) -> usize {
        self.requests().iter().filter(|u| u.contains(pattern)).count()
    }

    fn reply(&self, url: &str) -> Result<FetchedPage, CrawlError> {
        let reply = {
            let mut routes = self.routes.lock().unwrap();
            routes
                .iter_mut()
                .find(|r| url.contains(&r.pattern))
                .and_then(|route| {
                    if route.replies.len() > 1 {
                        route.replies.pop_front()
                    } else {
                        route.replies.front().cloned()
                    }
                })
        };
        match reply {
            Some(Reply::Page(status, body)) => Ok(FetchedPage {
                url: url.to_string(),
                status,
                body,
            }),
            Some(Reply::NetworkFailure) => Err(CrawlError::network(url, "connection reset by peer")),
            None => Ok(FetchedPage {
                url: url.to_string(),
                status: 404,
                body: String::new(),
            }),
        }
    }
}

#[async_trait]
impl Fetch for ScriptedFetcher {
    async fn get(&self, url: &str) -> Result<FetchedPage, CrawlError> {
        self.log.lock().unwrap().push(url.to_string());
        self.reply(url)
    }

    async fn post_json(&self, url: &str, _body: &Value) -> Result<FetchedPage, CrawlError> {
        self.log.lock().unwrap().push(format!("POST {url}"));
        self.reply(url)
    }
}
