use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use coap_wire::{Code, Packet};

/// A handler capable of serving some subset of the five CoAP methods for a
/// single resource path.
///
/// Mirrors the reference implementation's capability set -- one method per
/// verb, each with a default that answers 4.05 Method Not Allowed -- rather
/// than a closed enum, since the set of resource kinds is open (arbitrary
/// user-provided handlers).
pub trait Resource: Send + Sync {
  /// The name this resource is registered under.
  fn name(&self) -> &str;

  /// Handle a GET request, returning the response packet to send.
  fn handle_get(&self, request: &Packet) -> Packet {
    method_not_allowed(request)
  }

  /// Handle a POST request.
  fn handle_post(&self, request: &Packet) -> Packet {
    method_not_allowed(request)
  }

  /// Handle a PUT request.
  fn handle_put(&self, request: &Packet) -> Packet {
    method_not_allowed(request)
  }

  /// Handle a DELETE request.
  fn handle_delete(&self, request: &Packet) -> Packet {
    method_not_allowed(request)
  }

  /// Handle a FETCH request (RFC 8132).
  fn handle_fetch(&self, request: &Packet) -> Packet {
    method_not_allowed(request)
  }

  /// Dispatch `request` to the method handler matching its code.
  fn handle(&self, request: &Packet) -> Packet {
    match request.code {
      | Code::GET => self.handle_get(request),
      | Code::POST => self.handle_post(request),
      | Code::PUT => self.handle_put(request),
      | Code::DELETE => self.handle_delete(request),
      | Code::FETCH => self.handle_fetch(request),
      | _ => method_not_allowed(request),
    }
  }
}

fn method_not_allowed(request: &Packet) -> Packet {
  // A separate response, not a piggybacked ACK: the dispatcher's ingress
  // filter already sent the empty ACK for this CON's message id.
  let mut resp = Packet::new(coap_wire::Type::Non, Code::METHOD_NOT_ALLOWED, request.id);
  resp.token = request.token.clone();
  resp
}

/// Process-wide registry mapping URI paths to [`Resource`] handlers.
///
/// Mirrors the reference implementation's `ResourceManager`: one optional
/// default resource, served when no path-specific resource matches, and a
/// lookup table of named resources keyed by path.
pub struct ResourceManager {
  resources: RwLock<HashMap<String, Box<dyn Resource>>>,
  default: RwLock<Option<Box<dyn Resource>>>,
  root_path: Mutex<String>,
}

impl Default for ResourceManager {
  fn default() -> Self {
    Self { resources: RwLock::new(HashMap::new()),
           default: RwLock::new(None),
           root_path: Mutex::new(String::new()) }
  }
}

impl ResourceManager {
  /// Register a resource under `path`, replacing any resource previously
  /// registered at that path.
  pub fn add_resource(&self, path: impl Into<String>, resource: Box<dyn Resource>) {
    self.resources.write().unwrap().insert(path.into(), resource);
  }

  /// Register the resource served when no path-specific resource matches.
  pub fn add_default_resource(&self, resource: Box<dyn Resource>) {
    *self.default.write().unwrap() = Some(resource);
  }

  /// Look up the resource registered at `path`, if any.
  ///
  /// Returns a response rather than a handler reference, to keep the lock
  /// scope confined to this call.
  pub fn get_resource(&self, path: &str, request: &Packet) -> Option<Packet> {
    self.resources.read().unwrap().get(path).map(|r| r.handle(request))
  }

  /// Invoke the default resource, if one is registered.
  pub fn get_default_resource(&self, request: &Packet) -> Option<Packet> {
    self.default.read().unwrap().as_ref().map(|r| r.handle(request))
  }

  /// Set the path prefix stripped before matching a request's Uri-Path
  /// against registered resources.
  pub fn set_root_path(&self, root: impl Into<String>) {
    *self.root_path.lock().unwrap() = root.into();
  }

  /// Resolve and invoke the resource matching `request`'s Uri-Path options,
  /// falling back to the default resource, and finally to 4.04 Not Found.
  pub fn dispatch(&self, request: &Packet) -> Packet {
    let path = request.options
                       .get(&coap_wire::option::number::URI_PATH)
                       .map(|segments| {
                         segments.iter()
                                 .map(|s| String::from_utf8_lossy(s))
                                 .collect::<Vec<_>>()
                                 .join("/")
                       })
                       .unwrap_or_default();

    self.get_resource(&path, request)
        .or_else(|| self.get_default_resource(request))
        .unwrap_or_else(|| {
          let mut resp = Packet::new(coap_wire::Type::Non, Code::NOT_FOUND, request.id);
          resp.token = request.token.clone();
          resp
        })
  }

  /// Scan the filesystem under the root path for resources to register.
  ///
  /// No-op hook, as in the reference implementation; a concrete
  /// filesystem-backed scan is a separate concern from this core.
  pub fn discover_resources(&self) {}
}

#[cfg(test)]
mod test {
  use coap_wire::Type;

  use super::*;

  struct Echo;
  impl Resource for Echo {
    fn name(&self) -> &str {
      "echo"
    }

    fn handle_get(&self, request: &Packet) -> Packet {
      let mut resp = Packet::new(Type::Non, Code::CONTENT, request.id);
      resp.token = request.token.clone();
      resp.payload = b"hello".to_vec();
      resp
    }
  }

  #[test]
  fn dispatches_to_registered_resource() {
    let manager = ResourceManager::default();
    manager.add_resource("echo", Box::new(Echo));

    let mut req = Packet::new(Type::Con, Code::GET, 1);
    req.add_option(coap_wire::option::number::URI_PATH, b"echo".to_vec());

    let resp = manager.dispatch(&req);
    assert_eq!(resp.code, Code::CONTENT);
    assert_eq!(resp.payload, b"hello");
  }

  #[test]
  fn falls_back_to_default_then_not_found() {
    let manager = ResourceManager::default();
    let req = Packet::new(Type::Con, Code::GET, 1);

    assert_eq!(manager.dispatch(&req).code, Code::NOT_FOUND);

    manager.add_default_resource(Box::new(Echo));
    assert_eq!(manager.dispatch(&req).code, Code::CONTENT);
  }

  #[test]
  fn unhandled_method_is_method_not_allowed() {
    let manager = ResourceManager::default();
    manager.add_resource("echo", Box::new(Echo));

    let mut req = Packet::new(Type::Con, Code::DELETE, 1);
    req.add_option(coap_wire::option::number::URI_PATH, b"echo".to_vec());

    assert_eq!(manager.dispatch(&req).code, Code::METHOD_NOT_ALLOWED);
  }
}
