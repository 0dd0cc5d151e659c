use std::{
    error::Error,
    fs::{self, File},
};

use glob::glob;
use hperf_data::{ArchDesc, EventScope};
use quote::quote;

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed=events/");

    let mut architectures = vec![];
    for entry in glob("events/**/*.json")? {
        let path = entry?;
        println!("cargo:rerun-if-changed={}", path.display());

        let file = File::open(&path)?;
        let data: ArchDesc = serde_json::from_reader(file)?;
        data.validate()
            .map_err(|err| format!("{}: {err}", path.display()))?;

        let mut events = vec![];
        for evt in &data.events {
            let id = evt.id;
            let token = &evt.token;
            let name = &evt.name;
            let scope = match evt.scope {
                EventScope::Cpu => quote! { EventScope::Cpu },
                EventScope::Socket => quote! { EventScope::Socket },
                EventScope::System => quote! { EventScope::System },
            };
            events.push(quote! {
                EventDesc {
                    id: #id,
                    token: #token.to_string(),
                    name: #name.to_string(),
                    scope: #scope,
                }
            });
        }

        let metrics = data.metrics.iter().map(|metric| {
            let name = &metric.name;
            let expression = &metric.expression;
            quote! {
                Metric {
                    name: #name.to_string(),
                    expression: #expression.to_string(),
                }
            }
        });

        let groups = data.event_groups.iter().map(|group| {
            quote! { vec![#(#group),*] }
        });

        let arch_id = &data.arch_id;
        let name = &data.name;
        let vendor = &data.vendor;
        let isa = &data.isa;
        let available_counters = data.available_counters;
        let other_events = &data.other_events;
        let pinned_events = &data.pinned_events;

        architectures.push(quote! {
            architectures.insert(#arch_id.to_string(), ArchDesc {
                arch_id: #arch_id.to_string(),
                name: #name.to_string(),
                vendor: #vendor.to_string(),
                isa: #isa.to_string(),
                available_counters: #available_counters,
                events: vec![#(#events),*],
                other_events: vec![#(#other_events),*],
                pinned_events: vec![#(#pinned_events),*],
                event_groups: vec![#(#groups),*],
                metrics: vec![#(#metrics),*],
            });
        });
    }

    let all_architectures = quote! {
        lazy_static! {
            static ref ARCHITECTURES: BTreeMap<String, ArchDesc> = create_known_architectures_map();
        }

        fn create_known_architectures_map() -> BTreeMap<String, ArchDesc> {
            let mut architectures = BTreeMap::new();

            #(#architectures)*

            architectures
        }
    };

    let file = syn::parse2(all_architectures)?;
    let formatted = prettyplease::unparse(&file);

    fs::write(
        format!("{}/architectures.rs", std::env::var("OUT_DIR")?),
        formatted,
    )?;

    Ok(())
}
