// TLS identity loading and per-name selection through the routing table
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::Response;
    use rcgen::generate_simple_self_signed;

    use arbor::core::{
        Endpoint, EndpointResolver, NodeAddress, ProtocolVersion, RoutingTable, VirtualHost,
        WILDCARD_NAME,
        resolver::{Dispatcher, ResolvedRequest},
        vhost::{TlsIdentity, VirtualHostError},
    };

    fn noop_dispatcher() -> Dispatcher {
        Arc::new(|_resolved: ResolvedRequest| {
            Box::pin(async { Ok(Response::new(Bytes::new())) })
        })
    }

    fn secure_address() -> NodeAddress {
        NodeAddress::new("127.0.0.1", 8443, ProtocolVersion::Http1, true)
    }

    /// Write a generated identity for `name` as PEM files and load it back.
    fn identity_for(name: &str, dir: &std::path::Path) -> TlsIdentity {
        let generated = generate_simple_self_signed([name.to_string()]).unwrap();
        let cert_path = dir.join(format!("{name}.crt"));
        let key_path = dir.join(format!("{name}.key"));
        std::fs::write(&cert_path, generated.cert.pem()).unwrap();
        std::fs::write(&key_path, generated.signing_key.serialize_pem()).unwrap();
        TlsIdentity::from_pem_files(&cert_path, &key_path).unwrap()
    }

    fn secure_host(name: &str, identity: TlsIdentity) -> VirtualHost {
        let endpoint = Endpoint::builder("/").pattern("/**").build().unwrap();
        VirtualHost::builder(name)
            .address(secure_address())
            .resolver(EndpointResolver::new(vec![endpoint], noop_dispatcher()))
            .tls_identity(identity)
            .build()
            .unwrap()
    }

    #[test]
    fn test_pem_round_trip_loads_chain_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let identity = identity_for("example.com", dir.path());
        assert_eq!(identity.cert_chain().len(), 1);
    }

    #[test]
    fn test_missing_key_file_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let generated = generate_simple_self_signed(["example.com".to_string()]).unwrap();
        let cert_path = dir.path().join("only.crt");
        std::fs::write(&cert_path, generated.cert.pem()).unwrap();

        let result = TlsIdentity::from_pem_files(&cert_path, dir.path().join("absent.key"));
        assert!(matches!(result, Err(VirtualHostError::TlsRead { .. })));
    }

    #[test]
    fn test_secure_host_refuses_to_build_without_identity() {
        let result = VirtualHost::builder("secure.example.com")
            .address(secure_address())
            .build();
        assert!(matches!(
            result,
            Err(VirtualHostError::MissingTlsIdentity(_))
        ));
    }

    #[test]
    fn test_sni_name_selects_that_hosts_identity() {
        let dir = tempfile::tempdir().unwrap();
        let identity_a = identity_for("a.example.com", dir.path());
        let identity_b = identity_for("b.example.com", dir.path());
        let identity_default = identity_for("fallback.example.com", dir.path());

        let table = RoutingTable::builder()
            .host(secure_host(WILDCARD_NAME, identity_default.clone()))
            .host(secure_host("a.example.com", identity_a.clone()))
            .host(secure_host("b.example.com", identity_b.clone()))
            .build()
            .unwrap();

        let selected = table.identity_for(Some("a.example.com")).unwrap();
        assert_eq!(selected.cert_chain(), identity_a.cert_chain());

        let selected = table.identity_for(Some("b.example.com")).unwrap();
        assert_eq!(selected.cert_chain(), identity_b.cert_chain());

        // Unknown names fall back to the default host's identity, the same
        // resolution step request routing uses.
        let selected = table.identity_for(Some("unknown.example.com")).unwrap();
        assert_eq!(selected.cert_chain(), identity_default.cert_chain());
        let selected = table.identity_for(None).unwrap();
        assert_eq!(selected.cert_chain(), identity_default.cert_chain());
    }
}
