use idreg::{ClassSpec, ErrorKind, Hid, ObjectPtr, Registry, RegistryConfig};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Operation {
    Register(bool),
    IncRef(u8, bool),
    DecRef(u8, bool),
    Lookup(u8),
    Remove(u8),
    Substitute(u8, u16),
    SoftClear,
}

#[derive(Debug, Clone, Copy)]
struct ModelRec {
    object: usize,
    refs: u32,
    app: u32,
}

proptest! {
    #[test]
    fn test_registry_matches_model(ops in proptest::collection::vec(
        prop_oneof![
            any::<bool>().prop_map(Operation::Register),
            (any::<u8>(), any::<bool>()).prop_map(|(i, app)| Operation::IncRef(i, app)),
            (any::<u8>(), any::<bool>()).prop_map(|(i, app)| Operation::DecRef(i, app)),
            any::<u8>().prop_map(Operation::Lookup),
            any::<u8>().prop_map(Operation::Remove),
            (any::<u8>(), any::<u16>()).prop_map(|(i, v)| Operation::Substitute(i, v)),
            Just(Operation::SoftClear),
        ],
        1..200
    )) {
        let reg = Registry::new(RegistryConfig { max_desired_rec_fl_len: 4, ..Default::default() }).unwrap();
        let frees = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&frees);
        let c = reg
            .register_class(ClassSpec::new().free_fn(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })))
            .unwrap();

        let mut model: HashMap<Hid, ModelRec> = HashMap::new();
        let mut issued: Vec<Hid> = Vec::new();
        let mut model_frees = 0usize;
        let mut next_object = 1usize;

        for op in ops {
            let pick = |i: u8| issued.get(i as usize % issued.len().max(1)).copied();
            match op {
                Operation::Register(app) => {
                    let h = reg.register(c, ObjectPtr::from_addr(next_object), app).unwrap();
                    model.insert(h, ModelRec { object: next_object, refs: 1, app: u32::from(app) });
                    issued.push(h);
                    next_object += 1;
                }
                Operation::IncRef(i, app) => {
                    let Some(h) = pick(i) else { continue };
                    match model.get_mut(&h) {
                        Some(m) => {
                            m.refs += 1;
                            if app {
                                m.app += 1;
                            }
                            let expected = if app { m.app } else { m.refs };
                            prop_assert_eq!(reg.inc_ref(h, app).unwrap(), expected);
                        }
                        None => {
                            prop_assert_eq!(reg.inc_ref(h, app).unwrap_err().kind(), ErrorKind::NoSuchId);
                        }
                    }
                }
                Operation::DecRef(i, app) => {
                    let Some(h) = pick(i) else { continue };
                    let Some(mut m) = model.get(&h).copied() else {
                        prop_assert_eq!(reg.dec_ref(h, app).unwrap_err().kind(), ErrorKind::NoSuchId);
                        continue;
                    };
                    if app && m.app == 0 {
                        prop_assert_eq!(reg.dec_ref(h, app).unwrap_err().kind(), ErrorKind::BadArg);
                        continue;
                    }
                    let got = reg.dec_ref(h, app).unwrap();
                    if m.refs <= 1 || (app && m.app <= 1) {
                        model.remove(&h);
                        model_frees += 1;
                        prop_assert_eq!(got, 0);
                    } else {
                        m.refs -= 1;
                        if app {
                            m.app -= 1;
                        }
                        m.app = m.app.min(m.refs);
                        prop_assert_eq!(got, if app { m.app } else { m.refs });
                        prop_assert!(got > 0);
                        model.insert(h, m);
                    }
                }
                Operation::Lookup(i) => {
                    let Some(h) = pick(i) else { continue };
                    match model.get(&h) {
                        Some(m) => {
                            prop_assert_eq!(reg.lookup(h, c).unwrap().addr(), m.object);
                        }
                        None => {
                            prop_assert_eq!(reg.lookup(h, c).unwrap_err().kind(), ErrorKind::NoSuchId);
                        }
                    }
                }
                Operation::Remove(i) => {
                    let Some(h) = pick(i) else { continue };
                    match model.remove(&h) {
                        Some(m) => {
                            prop_assert_eq!(reg.remove(h, c).unwrap().addr(), m.object);
                        }
                        None => {
                            prop_assert_eq!(reg.remove(h, c).unwrap_err().kind(), ErrorKind::NoSuchId);
                        }
                    }
                }
                Operation::Substitute(i, v) => {
                    let Some(h) = pick(i) else { continue };
                    let object = 0x10_0000 + usize::from(v);
                    match model.get_mut(&h) {
                        Some(m) => {
                            let old = reg.substitute(h, c, ObjectPtr::from_addr(object)).unwrap();
                            prop_assert_eq!(old.addr(), m.object);
                            m.object = object;
                        }
                        None => {
                            prop_assert!(reg.substitute(h, c, ObjectPtr::from_addr(object)).is_err());
                        }
                    }
                }
                Operation::SoftClear => {
                    reg.clear_class(c, false).unwrap();
                    let before = model.len();
                    model.retain(|_, m| m.refs > 1);
                    model_frees += before - model.len();
                }
            }

            prop_assert_eq!(reg.class_members(c).unwrap(), model.len() as u64);
            prop_assert_eq!(frees.load(Ordering::SeqCst), model_frees);
        }

        for (&h, m) in &model {
            let refs = reg.get_ref(h, false).unwrap();
            let app = reg.get_ref(h, true).unwrap();
            prop_assert_eq!(refs, m.refs);
            prop_assert_eq!(app, m.app);
            prop_assert!(app <= refs);
            prop_assert_eq!(reg.is_valid(h), m.app > 0);
        }
    }
}
